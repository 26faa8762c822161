use std::net::IpAddr;
use std::sync::Arc;

use crate::application::admission::AdmissionController;
use crate::application::api_keys::ApiKeyService;
use crate::application::pipeline::PipelineService;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<PipelineService>,
    pub api_keys: Arc<ApiKeyService>,
    pub admission: Arc<AdmissionController>,
    /// Peers allowed to name the client in `x-forwarded-for`.
    pub trusted_proxies: Arc<[IpAddr]>,
}
