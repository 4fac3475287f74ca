use std::{fmt::Debug, future::Future, net::SocketAddr, sync::Arc};

use rpc::sma::StorageManagementAgentServer;
use tonic::{transport::Server, Request, Response, Status};

use crate::agent::Agent;

mod service;

pub use service::SmaService;

/// Structure that holds sensitive information about the current gRPC
/// method being executed.
#[derive(Debug)]
pub(crate) struct GrpcClientContext {
    /// Method arguments.
    pub args: String,
    /// Method id.
    pub id: String,
}

impl GrpcClientContext {
    #[track_caller]
    pub fn new<T>(req: &Request<T>, fid: &str) -> Self
    where
        T: Debug,
    {
        Self {
            args: format!("{:?}", req.get_ref()),
            id: fid.to_string(),
        }
    }
}

/// Trait to lock serialize gRPC request outstanding.
#[async_trait::async_trait]
pub(crate) trait Serializer<F, T> {
    async fn locked(&self, ctx: GrpcClientContext, f: F) -> Result<T, Status>;
}

pub type GrpcResult<T> = std::result::Result<Response<T>, Status>;

pub struct SmaGrpcServer;

impl SmaGrpcServer {
    /// Serve the agent on `endpoint` until `shutdown` completes.
    pub async fn run<S>(
        endpoint: SocketAddr,
        agent: Arc<Agent>,
        shutdown: S,
    ) -> Result<(), tonic::transport::Error>
    where
        S: Future<Output = ()>,
    {
        info!("gRPC server configured at address {}", endpoint);
        Server::builder()
            .add_service(StorageManagementAgentServer::new(SmaService::new(
                agent,
            )))
            .serve_with_shutdown(endpoint, shutdown)
            .await
    }
}
