// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{future::BoxFuture, FutureExt};
use http::header::AUTHORIZATION;
use jsonrpsee::server::middleware::rpc::RpcServiceT;
use jsonrpsee::types::ErrorObject;
use jsonrpsee::MethodResponse;
use tower::{Layer, Service};
use tracing::debug;

use super::method_permission;
use crate::auth::{verify_token, READ};

const AUTH_ERROR_CODE: i32 = -32001;

/// The request's `Authorization` header (for websockets, the one sent with
/// the connection handshake), carried to the RPC layer through request
/// extensions.
#[derive(Clone, Debug)]
pub struct AuthorizationHeader(pub String);

/// HTTP middleware layer copying the `Authorization` header into the request
/// extensions, where the RPC-level [`AuthLayer`] reads it back per call.
#[derive(Clone, Default)]
pub struct AuthHeaderLayer;

impl<S> Layer<S> for AuthHeaderLayer {
    type Service = AuthHeaderService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AuthHeaderService { service }
    }
}

#[derive(Clone)]
pub struct AuthHeaderService<S> {
    service: S,
}

impl<S, B> Service<http::Request<B>> for AuthHeaderService<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| AuthorizationHeader(value.to_string()));
        if let Some(header) = header {
            req.extensions_mut().insert(header);
        }
        self.service.call(req)
    }
}

/// Enforces the per-method permission map against the JWT carried in the
/// request's `Authorization` header. Requests without a token act with
/// `read` permissions only.
#[derive(Clone)]
pub struct AuthLayer {
    pub secret: Arc<Vec<u8>>,
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, service: S) -> Self::Service {
        AuthMiddleware {
            secret: self.secret.clone(),
            service,
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    secret: Arc<Vec<u8>>,
    service: S,
}

impl<'a, S> RpcServiceT<'a> for AuthMiddleware<S>
where
    S: RpcServiceT<'a> + Send + Sync + Clone + 'static,
{
    type Future = BoxFuture<'a, MethodResponse>;

    fn call(&self, req: jsonrpsee::types::Request<'a>) -> Self::Future {
        let authorization = req
            .extensions()
            .get::<AuthorizationHeader>()
            .map(|header| header.0.clone());
        match check_access(authorization.as_deref(), &self.secret, req.method_name()) {
            Ok(()) => self.service.call(req).boxed(),
            Err(reason) => {
                debug!(method = req.method_name(), "rpc access denied: {reason}");
                let id = req.id.clone();
                async move {
                    MethodResponse::error(
                        id,
                        ErrorObject::owned(AUTH_ERROR_CODE, reason, None::<()>),
                    )
                }
                .boxed()
            }
        }
    }
}

/// Resolve the caller's permissions from the raw `Authorization` header
/// value and check them against the method's required tag.
pub fn check_access(
    authorization: Option<&str>,
    secret: &[u8],
    method: &str,
) -> Result<(), String> {
    let perms: Vec<String> = match authorization {
        Some(header) => {
            let token = header.trim_start_matches("Bearer ").trim();
            verify_token(token, secret).map_err(|e| format!("token verification failed: {e}"))?
        }
        None => READ.iter().map(|s| s.to_string()).collect(),
    };
    let required = method_permission(method);
    if perms.iter().any(|p| p == required) {
        Ok(())
    } else {
        Err(format!("{method} requires `{required}` permission"))
    }
}
