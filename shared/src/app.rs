//! The shared core as the host sees it: one value built from the host's
//! capabilities, holding every service over a single session.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::auth::AuthService;
use crate::capabilities::Capabilities;
use crate::catalog::{DroneService, MessageService, UserService};
use crate::config::ClientConfig;
use crate::location::{AddressService, LocationService};
use crate::market::{CargoService, DemandService, OfferService};
use crate::model::User;
use crate::orders::OrderController;
use crate::payment::PaymentFlow;
use crate::pipeline::ApiClient;
use crate::realtime::RealtimeChannel;
use crate::session::Session;
use crate::AppResult;

#[derive(Debug)]
pub struct Core {
    api: Arc<ApiClient>,
    realtime: Option<RealtimeChannel>,
    pub auth: AuthService,
    pub orders: OrderController,
    pub payments: PaymentFlow,
    pub drones: DroneService,
    pub users: UserService,
    pub messages: MessageService,
    pub offers: OfferService,
    pub demands: DemandService,
    pub cargo: CargoService,
    pub locations: LocationService,
    pub addresses: AddressService,
}

impl Core {
    /// The session is persisted in the host's key-value store. Without a
    /// socket capability the core runs without real-time events.
    pub fn new(config: ClientConfig, capabilities: Capabilities) -> AppResult<Self> {
        let session = Session::with_store(capabilities.kv);
        let api = Arc::new(ApiClient::new(
            config.clone(),
            capabilities.http,
            session.clone(),
        )?);
        let realtime = capabilities
            .socket
            .map(|socket| RealtimeChannel::new(socket, session, &config))
            .transpose()?;

        Ok(Self {
            auth: AuthService::new(api.clone()),
            orders: OrderController::new(api.clone()),
            payments: PaymentFlow::new(api.clone()),
            drones: DroneService::new(api.clone()),
            users: UserService::new(api.clone()),
            messages: MessageService::new(api.clone()),
            offers: OfferService::new(api.clone()),
            demands: DemandService::new(api.clone()),
            cargo: CargoService::new(api.clone()),
            locations: LocationService::new(api.clone()),
            addresses: AddressService::new(api.clone()),
            realtime,
            api,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.api.config()
    }

    pub fn session(&self) -> &Session {
        self.api.session()
    }

    pub fn realtime(&self) -> Option<&RealtimeChannel> {
        self.realtime.as_ref()
    }

    /// Restores the persisted session, if any, and opens the real-time
    /// channel for it.
    #[instrument(skip(self))]
    pub async fn start(&self) -> AppResult<Option<User>> {
        let user = self.auth.restore().await?;
        match &user {
            Some(user) => {
                info!(user_id = %user.id, "Resumed session");
                self.connect_realtime()?;
            }
            None => info!("No session to resume"),
        }
        Ok(user)
    }

    /// Opens the real-time channel for the current session. A no-op when the
    /// host supplied no socket capability or the channel is already running.
    pub fn connect_realtime(&self) -> AppResult<()> {
        if let Some(channel) = &self.realtime {
            channel.connect()?;
        }
        Ok(())
    }
}
