/// Subresources that may trail an object name in an API path.
const SUBRESOURCES: &[&str] = &["status", "scale", "finalize", "log", "exec", "approval"];

/// Collapse a Kubernetes API path into a low-cardinality template: object
/// names and namespaces become placeholders, everything that is not a
/// recognizable API path becomes `/other`.
///
/// `/api/v1/namespaces/ns-a/configmaps/cm1` →
/// `/api/v1/namespaces/{namespace}/configmaps/{name}`
pub fn endpoint_template(path: &str) -> String {
    let query_stripped = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = query_stripped.split('/').filter(|s| !s.is_empty()).collect();

    // /api/<version>/... or /apis/<group>/<version>/...
    let rest = match segments.first() {
        Some(&"api") if segments.len() >= 2 => &segments[2..],
        Some(&"apis") if segments.len() >= 3 => &segments[3..],
        _ => return "/other".to_string(),
    };
    let prefix_len = segments.len() - rest.len();
    let mut out: Vec<String> = segments[..prefix_len].iter().map(|s| s.to_string()).collect();

    let mut rest = rest.iter().peekable();
    if rest.peek() == Some(&&"namespaces") {
        out.push("namespaces".to_string());
        rest.next();
        if rest.next().is_some() {
            out.push("{namespace}".to_string());
        }
    }
    if let Some(resource) = rest.next() {
        out.push(resource.to_string());
    }
    if rest.next().is_some() {
        out.push("{name}".to_string());
    }
    if let Some(&tail) = rest.next() {
        if SUBRESOURCES.contains(&tail) {
            out.push(tail.to_string());
        } else {
            return "/other".to_string();
        }
    }
    format!("/{}", out.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_group_paths() {
        assert_eq!(endpoint_template("/api/v1/configmaps"), "/api/v1/configmaps");
        assert_eq!(
            endpoint_template("/api/v1/namespaces/ns-a/configmaps/cm1"),
            "/api/v1/namespaces/{namespace}/configmaps/{name}"
        );
        assert_eq!(
            endpoint_template("/api/v1/nodes/node-1"),
            "/api/v1/nodes/{name}"
        );
    }

    #[test]
    fn named_group_paths() {
        assert_eq!(
            endpoint_template("/apis/apps/v1/namespaces/ns/deployments/web/status"),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}/status"
        );
        assert_eq!(
            endpoint_template("/apis/configbutler.io/v1alpha1/watchrules"),
            "/apis/configbutler.io/v1alpha1/watchrules"
        );
    }

    #[test]
    fn query_strings_are_ignored() {
        assert_eq!(
            endpoint_template("/api/v1/namespaces/ns/configmaps?watch=true"),
            "/api/v1/namespaces/{namespace}/configmaps"
        );
    }

    #[test]
    fn unknown_shapes_collapse() {
        assert_eq!(endpoint_template("/healthz"), "/other");
        assert_eq!(endpoint_template("/"), "/other");
        assert_eq!(
            endpoint_template("/api/v1/namespaces/ns/pods/p/portforward/extra"),
            "/other"
        );
    }
}
