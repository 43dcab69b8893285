//! Shared application state: the wired-up use cases.

use std::sync::Arc;

use hiroba_shared::time::Clock;

use crate::config::Config;
use crate::domain::DataStore;
use crate::infrastructure::registry::ConnectionRegistry;
use crate::infrastructure::relay::{MediaRelay, RelayError};
use crate::usecase::{
    ChannelUseCase, ChatUseCase, ConnectUseCase, HubRelayEvents, MediaUseCase, RadioUseCase,
    ScreenUseCase, VoiceUseCase,
};

pub struct AppState {
    pub connect: Arc<ConnectUseCase>,
    pub chat: Arc<ChatUseCase>,
    pub channels: Arc<ChannelUseCase>,
    pub voice: Arc<VoiceUseCase>,
    pub screen: Arc<ScreenUseCase>,
    pub radio: Arc<RadioUseCase>,
    pub media: Arc<MediaUseCase>,
    pub registry: Arc<ConnectionRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire the hub together: registry, relay, then the use cases on top.
    pub fn build(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Result<Arc<Self>, RelayError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = MediaRelay::new(
            &config.stun_server,
            &config.public_ip,
            HubRelayEvents::new(Arc::clone(&registry)),
        )?;

        let radio = RadioUseCase::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
        );
        let media = MediaUseCase::new(Arc::clone(&registry), Arc::clone(&clock));
        let chat = ChatUseCase::new(Arc::clone(&store), Arc::clone(&registry));
        let channels = ChannelUseCase::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&relay),
        );
        let voice = VoiceUseCase::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&relay),
        );
        let screen = ScreenUseCase::new(Arc::clone(&registry), Arc::clone(&relay));
        let connect = ConnectUseCase::new(
            store,
            Arc::clone(&registry),
            relay,
            Arc::clone(&radio),
            Arc::clone(&media),
            Arc::clone(&clock),
        );

        Ok(Arc::new(Self {
            connect,
            chat,
            channels,
            voice,
            screen,
            radio,
            media,
            registry,
            clock,
        }))
    }
}
