use crate::{codec, Result, RpcError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased async handler.
///
/// Takes the request body already parsed as JSON and returns the encoded
/// response body. Wrapped in `Arc` for cheap cloning out of the registry.
pub(super) type BoxedHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<Bytes>> + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler.
///
/// Request shape mismatches surface as [`RpcError::Decode`]; any error
/// returned by the handler itself is reported as [`RpcError::Handler`].
pub(super) fn wrap_handler<F, Fut, TReq, TResp>(handler: F) -> BoxedHandler
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |value: Value| -> BoxFuture<Result<Bytes>> {
        let req: TReq = match codec::from_value(value) {
            Ok(req) => req,
            Err(err) => return Box::pin(async move { Err::<Bytes, _>(err) }),
        };

        let fut = handler(req);

        Box::pin(async move {
            let resp = fut.await.map_err(|err| match err {
                RpcError::Handler(_) => err,
                other => RpcError::Handler(other.to_string()),
            })?;
            codec::encode(&resp)
        })
    })
}
