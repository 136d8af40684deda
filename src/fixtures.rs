//! Mocked Kubernetes API server for reconciler tests.

use http::{Request, Response};
use kube::{client::Body, Client};
use serde::Serialize;
use tower_test::mock::{self, Handle};

type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

pub struct ApiServerVerifier(ApiServerHandle);

pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), ApiServerVerifier(handle))
}

impl ApiServerVerifier {
    /// Serves every GET with the given object, acknowledges every PATCH with
    /// the same object, and records the PATCH bodies for assertions. Runs
    /// until the client side is dropped.
    pub fn serve_object<K>(mut self, object: K) -> tokio::task::JoinHandle<Vec<serde_json::Value>>
    where
        K: Serialize + Send + 'static,
    {
        tokio::spawn(async move {
            let response_body = serde_json::to_vec(&object).unwrap();
            let mut patches = Vec::new();
            while let Some((request, send)) = self.0.next_request().await {
                let method = request.method().clone();
                let bytes = request.into_body().collect_bytes().await.unwrap();
                if method == http::Method::PATCH {
                    patches.push(serde_json::from_slice(&bytes).unwrap());
                }
                send.send_response(
                    Response::builder()
                        .body(Body::from(response_body.clone()))
                        .unwrap(),
                );
            }
            patches
        })
    }
}
