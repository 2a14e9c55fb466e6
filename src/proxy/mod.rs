mod body;
mod codec;
mod handler;
pub mod listener;
mod request;
mod respond;
mod tunnel;
mod upstream;

use std::sync::Arc;

use crate::cache::Storage;
use crate::egress::EgressDialer;
use crate::rules::Rules;
use crate::settings::Settings;

/// Everything a connection task needs, cheap to clone per connection.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub storage: Arc<Storage>,
    pub rules: Arc<Rules>,
    pub egress: Arc<EgressDialer>,
    pub tls: Arc<rustls::ClientConfig>,
    /// Process-global upstream keep-alive pool and connection budget.
    pub(crate) pool: Arc<upstream::UpstreamPool>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        storage: Arc<Storage>,
        rules: Arc<Rules>,
        egress: Arc<EgressDialer>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self {
            settings,
            storage,
            rules,
            egress,
            tls,
            pool: Arc::new(upstream::UpstreamPool::new()),
        }
    }
}
