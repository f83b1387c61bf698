#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    //! End-to-end scenarios against a real cluster (kind is fine) and a
    //! local bare git remote. The whole pipeline runs in-process: rule
    //! store, router, watch manager, branch workers. Admission is not
    //! served here, so commit authors fall back to `unknown@configbutler`.

    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use configbutler::correlation::CorrelationIndex;
    use configbutler::crd::rule::{RuleClause, WatchRuleSpec};
    use configbutler::crd::NamespacedRef;
    use configbutler::crd::WatchRule;
    use configbutler::encrypt::EncryptionWriter;
    use configbutler::identity::ResourceReference;
    use configbutler::metrics::Metrics;
    use configbutler::router::{DestinationBinding, EventRouter};
    use configbutler::rules::{compile_watch_rule, RuleStore};
    use configbutler::settings::Settings;
    use configbutler::watch::{run_namespace_watch, NamespaceLabelCache, WatchManager};

    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use tempfile::TempDir;
    use tokio::sync::watch;
    use tokio::time::{sleep, timeout};

    struct Stack {
        rules: Arc<RuleStore>,
        router: Arc<EventRouter>,
        watch_manager: Arc<WatchManager>,
        shutdown: watch::Sender<bool>,
    }

    async fn start_stack(client: Client, work_dir: &Path) -> Stack {
        let metrics = Arc::new(Metrics::default());
        let settings = Arc::new(Settings {
            work_dir: work_dir.to_path_buf(),
            cluster_uid: "e2e-cluster".into(),
            instance_id: "e2e".into(),
            batch_max_wait: Duration::from_secs(1),
            remote_sync_interval: Duration::from_secs(5),
            ..Settings::default()
        });
        let namespaces = Arc::new(NamespaceLabelCache::default());
        let rules = Arc::new(RuleStore::new(namespaces.clone()));
        let correlation = Arc::new(CorrelationIndex::new(
            Duration::from_secs(60),
            1024,
            Default::default(),
        ));
        let encryptor = Arc::new(EncryptionWriter::default());

        let (router, channels) =
            EventRouter::new(client.clone(), settings, metrics.clone(), encryptor);
        let watch_manager = WatchManager::new(
            client.clone(),
            rules.clone(),
            correlation,
            router.clone(),
            metrics,
            Duration::from_secs(300),
        );
        router.set_watch_manager(watch_manager.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_namespace_watch(
            client.clone(),
            namespaces,
            shutdown_rx.clone(),
        ));
        tokio::spawn(router.clone().run(channels, shutdown_rx.clone()));
        tokio::spawn(watch_manager.clone().run(shutdown_rx));

        Stack {
            rules,
            router,
            watch_manager,
            shutdown,
        }
    }

    fn bare_remote(dir: &TempDir) -> String {
        let path = dir.path().join("remote.git");
        git2::Repository::init_bare(&path).unwrap();
        path.to_string_lossy().to_string()
    }

    fn configmap_rule(namespace: &str) -> WatchRule {
        let mut rule = WatchRule::new(
            "audit-configmaps",
            WatchRuleSpec {
                destination_ref: NamespacedRef {
                    name: "audit".into(),
                    namespace: None,
                },
                rules: vec![RuleClause {
                    operations: vec!["*".into()],
                    api_groups: vec!["".into()],
                    api_versions: vec!["v1".into()],
                    resources: vec!["configmaps".into()],
                }],
            },
        );
        rule.metadata.namespace = Some(namespace.to_string());
        rule
    }

    async fn ensure_namespace(client: &Client, name: &str) {
        let api = Api::<Namespace>::all(client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        let _ = api.create(&PostParams::default(), &ns).await;
    }

    async fn create_configmap(client: &Client, namespace: &str, name: &str, value: &str) {
        let api = Api::<ConfigMap>::namespaced(client.clone(), namespace);
        let mut data = BTreeMap::new();
        data.insert("k".to_string(), value.to_string());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        };
        let _ = api.delete(name, &DeleteParams::default()).await;
        api.create(&PostParams::default(), &cm)
            .await
            .expect("create configmap");
    }

    /// Path of a file inside the remote's branch tip, if present.
    fn remote_has_file(remote: &str, file: &str) -> bool {
        let repo = match git2::Repository::open_bare(remote) {
            Ok(repo) => repo,
            Err(_) => return false,
        };
        let Ok(reference) = repo.find_reference("refs/heads/main") else {
            return false;
        };
        let commit = reference.peel_to_commit().unwrap();
        commit.tree().unwrap().get_path(Path::new(file)).is_ok()
    }

    fn remote_head_author(remote: &str) -> Option<String> {
        let repo = git2::Repository::open_bare(remote).ok()?;
        let commit = repo
            .find_reference("refs/heads/main")
            .ok()?
            .peel_to_commit()
            .ok()?;
        commit.author().name().map(str::to_string)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        timeout(Duration::from_secs(120), async {
            loop {
                if check() {
                    return;
                }
                sleep(Duration::from_secs(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seed_then_live_mirrors_configmaps() {
        let client = Client::try_default().await.expect("cluster available");
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(&tmp);
        let stack = start_stack(client.clone(), &tmp.path().join("work")).await;

        let ns = "cb-e2e-seed";
        ensure_namespace(&client, ns).await;
        create_configmap(&client, ns, "cm1", "before").await;

        stack
            .rules
            .upsert(compile_watch_rule(&configmap_rule(ns)).unwrap());
        stack
            .router
            .register_destination(DestinationBinding {
                destination: ResourceReference::new(ns, "audit"),
                remote_url: remote.clone(),
                branch: "main".into(),
                base_folder: "audit".into(),
                repo_namespace: ns.into(),
                secret_name: None,
            })
            .await
            .unwrap();
        stack
            .watch_manager
            .reconcile_for_rule_change(true)
            .await
            .unwrap();

        // startup seed lands the pre-existing object
        let seeded = format!("audit/v1/configmaps/{ns}/cm1.yaml");
        wait_for("seed commit", || remote_has_file(&remote, &seeded)).await;

        // live update produces a follow-up commit
        let api = Api::<ConfigMap>::namespaced(client.clone(), ns);
        api.patch(
            "cm1",
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({"data": {"k": "after"}})),
        )
        .await
        .unwrap();
        create_configmap(&client, ns, "cm2", "v").await;
        let second = format!("audit/v1/configmaps/{ns}/cm2.yaml");
        wait_for("live commit", || remote_has_file(&remote, &second)).await;

        // no admission webhook in this harness: attribution falls back
        assert_eq!(
            remote_head_author(&remote).as_deref(),
            Some("unknown@configbutler")
        );
        let _ = stack.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn orphan_sweep_removes_stale_files() {
        let client = Client::try_default().await.expect("cluster available");
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(&tmp);
        let ns = "cb-e2e-orphan";

        // seed the remote with a file no live object maps to
        {
            let seed = tmp.path().join("seed");
            let repo = git2::Repository::init(&seed).unwrap();
            repo.remote("origin", &remote).unwrap();
            repo.set_head("refs/heads/main").unwrap();
            let orphan = seed.join(format!("audit/v1/configmaps/{ns}/old.yaml"));
            std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
            std::fs::write(&orphan, "data: stale\n").unwrap();
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = git2::Signature::now("seed", "seed@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "seed orphan", &tree, &[])
                .unwrap();
            repo.find_remote("origin")
                .unwrap()
                .push(&["refs/heads/main:refs/heads/main"], None)
                .unwrap();
        }

        let stack = start_stack(client.clone(), &tmp.path().join("work")).await;
        ensure_namespace(&client, ns).await;
        stack
            .rules
            .upsert(compile_watch_rule(&configmap_rule(ns)).unwrap());
        stack
            .router
            .register_destination(DestinationBinding {
                destination: ResourceReference::new(ns, "audit"),
                remote_url: remote.clone(),
                branch: "main".into(),
                base_folder: "audit".into(),
                repo_namespace: ns.into(),
                secret_name: None,
            })
            .await
            .unwrap();
        stack
            .watch_manager
            .reconcile_for_rule_change(true)
            .await
            .unwrap();

        let orphan = format!("audit/v1/configmaps/{ns}/old.yaml");
        wait_for("orphan sweep", || !remote_has_file(&remote, &orphan)).await;
        let _ = stack.shutdown.send(true);
    }
}
