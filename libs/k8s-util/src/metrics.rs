use crate::url::endpoint_template;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FutureExt;
use http::Request;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tower::{Layer, Service};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct RequestLabels {
    pub method: String,
    pub endpoint: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct StatusCodeLabel {
    pub status_code: String,
}

/// Tower layer observing every API-server request the client makes, labelled
/// by method and templated endpoint (bounded cardinality by construction).
pub struct MetricsLayer {
    request_duration: Family<RequestLabels, Histogram>,
    requests_total: Family<StatusCodeLabel, Counter>,
}

impl MetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let request_duration = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1., 5.].into_iter())
        });
        let requests_total = Family::<StatusCodeLabel, Counter>::default();

        registry.register(
            "kubernetes_client_http_request_duration_seconds",
            "Latency of Kubernetes client requests by method and endpoint template",
            request_duration.clone(),
        );
        registry.register(
            "kubernetes_client_http_requests",
            "Kubernetes client requests by response status code",
            requests_total.clone(),
        );

        Self {
            request_duration,
            requests_total,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            request_duration: self.request_duration.clone(),
            requests_total: self.requests_total.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    request_duration: Family<RequestLabels, Histogram>,
    requests_total: Family<StatusCodeLabel, Counter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let labels = RequestLabels {
            method: req.method().as_str().to_string(),
            endpoint: endpoint_template(req.uri().path()),
        };
        let start_time = Instant::now();

        let fut = self.inner.call(req);
        let request_duration = self.request_duration.clone();
        let requests_total = self.requests_total.clone();
        async move {
            let result = fut.await;
            request_duration
                .get_or_create(&labels)
                .observe(start_time.elapsed().as_secs_f64());
            if let Ok(ref response) = result {
                requests_total
                    .get_or_create(&StatusCodeLabel {
                        status_code: response.status().as_u16().to_string(),
                    })
                    .inc();
            }
            result
        }
        .boxed()
    }
}
