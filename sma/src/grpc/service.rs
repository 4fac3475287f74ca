use std::{panic::AssertUnwindSafe, sync::Arc};

use ::function_name::named;
use futures::FutureExt;
use rpc::sma::{
    AttachVolumeRequest,
    AttachVolumeResponse,
    CreateDeviceRequest,
    CreateDeviceResponse,
    DeleteDeviceRequest,
    DeleteDeviceResponse,
    DetachVolumeRequest,
    DetachVolumeResponse,
    GetQosCapabilitiesRequest,
    GetQosCapabilitiesResponse,
    SetQosRequest,
    SetQosResponse,
    StorageManagementAgent,
};
use tonic::{Request, Response, Status};

use super::{GrpcClientContext, GrpcResult, Serializer};
use crate::agent::Agent;

/// gRPC front end of the agent. Requests are executed one at a time.
pub struct SmaService {
    agent: Arc<Agent>,
    client_context: tokio::sync::Mutex<Option<GrpcClientContext>>,
}

#[async_trait::async_trait]
impl<F, T> Serializer<F, T> for SmaService
where
    T: Send + 'static,
    F: core::future::Future<Output = Result<T, Status>> + Send + 'static,
{
    async fn locked(&self, ctx: GrpcClientContext, f: F) -> Result<T, Status> {
        let mut context_guard = self.client_context.lock().await;

        // Store context as a marker of to detect abnormal termination of the
        // request. A request whose future was dropped, e.g. because the
        // client went away, leaves its marker behind for the next one.
        if let Some(c) = context_guard.replace(ctx) {
            warn!("{}: gRPC method timed out, args: {}", c.id, c.args);
        }

        let fut = AssertUnwindSafe(f).catch_unwind();
        let r = fut.await;

        // Request completed, remove the marker.
        let ctx = context_guard.take();

        match r {
            Ok(r) => r,
            Err(_e) => {
                let (id, args) = ctx
                    .map(|c| (c.id, c.args))
                    .unwrap_or_default();
                warn!("{}: gRPC method panicked, args: {}", id, args);
                Err(Status::cancelled(format!("{}: gRPC method panicked", id)))
            }
        }
    }
}

impl SmaService {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            client_context: tokio::sync::Mutex::new(None),
        }
    }
}

#[tonic::async_trait]
impl StorageManagementAgent for SmaService {
    #[named]
    async fn create_device(
        &self,
        request: Request<CreateDeviceRequest>,
    ) -> GrpcResult<CreateDeviceResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent
                    .create_device(request.into_inner())
                    .await
                    .map(Response::new)
            },
        )
        .await
    }

    #[named]
    async fn delete_device(
        &self,
        request: Request<DeleteDeviceRequest>,
    ) -> GrpcResult<DeleteDeviceResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent.delete_device(request.into_inner()).await?;
                Ok(Response::new(DeleteDeviceResponse {}))
            },
        )
        .await
    }

    #[named]
    async fn attach_volume(
        &self,
        request: Request<AttachVolumeRequest>,
    ) -> GrpcResult<AttachVolumeResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent.attach_volume(request.into_inner()).await?;
                Ok(Response::new(AttachVolumeResponse {}))
            },
        )
        .await
    }

    #[named]
    async fn detach_volume(
        &self,
        request: Request<DetachVolumeRequest>,
    ) -> GrpcResult<DetachVolumeResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent.detach_volume(request.into_inner()).await?;
                Ok(Response::new(DetachVolumeResponse {}))
            },
        )
        .await
    }

    #[named]
    async fn set_qos(
        &self,
        request: Request<SetQosRequest>,
    ) -> GrpcResult<SetQosResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent.set_qos(request.into_inner()).await?;
                Ok(Response::new(SetQosResponse {}))
            },
        )
        .await
    }

    #[named]
    async fn get_qos_capabilities(
        &self,
        request: Request<GetQosCapabilitiesRequest>,
    ) -> GrpcResult<GetQosCapabilitiesResponse> {
        let agent = self.agent.clone();
        self.locked(
            GrpcClientContext::new(&request, function_name!()),
            async move {
                agent
                    .get_qos_capabilities(request.into_inner())
                    .await
                    .map(Response::new)
            },
        )
        .await
    }
}
