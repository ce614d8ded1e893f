use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::{Request, Response};

/// The upstream the cache interposes on: any request-to-response function.
/// Errors propagate to the caller unchanged; the cache never retries the
/// transport on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, req: Request) -> Result<Response>;
}

/// Adapts a plain async closure into a [`Transport`].
pub struct TransportFn<F> {
    fetch: F,
}

impl<F> TransportFn<F> {
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send,
{
    async fn fetch(&self, req: Request) -> Result<Response> {
        (self.fetch)(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn transport_fn_forwards_requests() -> Result<()> {
        let transport = TransportFn::new(|req: Request| async move {
            let mut res = Response::new(Bytes::from(req.uri().to_string()));
            *res.status_mut() = http::StatusCode::OK;
            Ok::<_, anyhow::Error>(res)
        });
        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = "http://example.com/echo".parse().unwrap();
        let res = transport.fetch(req).await?;
        assert_eq!(res.body().as_ref(), b"http://example.com/echo");
        Ok(())
    }
}
