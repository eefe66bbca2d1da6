//! Session factory: the immutable, shareable half of the engine.
//!
//! A factory bundles the metamodel with its collaborators (storage,
//! identifier generation, statistics, clock), the settings, and the event
//! listener registry. It is built once and shared behind an `Arc`; every
//! session it opens borrows those collaborators.

use crate::config::Settings;
use crate::event::EventListenerRegistry;
use crate::id_generator::{IdentifierGenerator, SequenceIdentifierGenerator};
use crate::listeners::register_default_listeners;
use crate::session::Session;
use crate::statistics::{Statistics, StatisticsSink};
use crate::storage::{MemoryStorage, Storage};
use graft_core::{Metamodel, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source for timestamp versions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

type ListenerConfig = Box<dyn FnOnce(&mut EventListenerRegistry) -> Result<()>>;

/// Builder for [`SessionFactory`].
///
/// Unset collaborators default to [`MemoryStorage`], a
/// [`SequenceIdentifierGenerator`] over the metamodel's sequences,
/// [`Statistics`] enabled per `generate_statistics`, and [`SystemClock`].
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    storage: Option<Arc<dyn Storage>>,
    id_generator: Option<Arc<dyn IdentifierGenerator>>,
    statistics: Option<Arc<dyn StatisticsSink>>,
    clock: Option<Arc<dyn Clock>>,
    settings: Settings,
    listener_configs: Vec<ListenerConfig>,
}

impl SessionFactoryBuilder {
    fn new(metamodel: Metamodel) -> Self {
        Self {
            metamodel,
            storage: None,
            id_generator: None,
            statistics: None,
            clock: None,
            settings: Settings::default(),
            listener_configs: Vec::new(),
        }
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn id_generator(mut self, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    #[must_use]
    pub fn statistics(mut self, statistics: Arc<dyn StatisticsSink>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Adjust the listener registry after the defaults are installed.
    ///
    /// Callbacks run in the order they were added.
    #[must_use]
    pub fn configure_listeners(
        mut self,
        configure: impl FnOnce(&mut EventListenerRegistry) -> Result<()> + 'static,
    ) -> Self {
        self.listener_configs.push(Box::new(configure));
        self
    }

    pub fn build(self) -> Result<Arc<SessionFactory>> {
        let mut listeners = EventListenerRegistry::new();
        register_default_listeners(&mut listeners)?;
        for configure in self.listener_configs {
            configure(&mut listeners)?;
        }

        let id_generator = self.id_generator.unwrap_or_else(|| {
            Arc::new(SequenceIdentifierGenerator::new(self.metamodel.database()))
        });
        let statistics = self
            .statistics
            .unwrap_or_else(|| Arc::new(Statistics::new(self.settings.generate_statistics)));
        let factory = SessionFactory {
            metamodel: Arc::new(self.metamodel),
            storage: self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            id_generator,
            statistics,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: self.settings,
            listeners,
        };
        tracing::info!(
            entities = factory.metamodel.entities().count(),
            entity_copy_observer = %factory.settings.entity_copy_observer,
            statistics = factory.statistics.is_enabled(),
            "Built session factory"
        );
        Ok(Arc::new(factory))
    }
}

impl fmt::Debug for SessionFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactoryBuilder")
            .field("settings", &self.settings)
            .field("listener_configs", &self.listener_configs.len())
            .finish_non_exhaustive()
    }
}

/// Shared configuration and collaborators of all sessions.
pub struct SessionFactory {
    metamodel: Arc<Metamodel>,
    storage: Arc<dyn Storage>,
    id_generator: Arc<dyn IdentifierGenerator>,
    statistics: Arc<dyn StatisticsSink>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    listeners: EventListenerRegistry,
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(metamodel)
    }

    /// Open a session bound to this factory.
    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn id_generator(&self) -> &dyn IdentifierGenerator {
        self.id_generator.as_ref()
    }

    pub fn statistics(&self) -> &dyn StatisticsSink {
        self.statistics.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn listeners(&self) -> &EventListenerRegistry {
        &self.listeners
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("metamodel", &self.metamodel)
            .field("clock", &self.clock)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MERGE, PRE_INSERT, PreInsertEvent, PreInsertEventListener};
    use crate::event::{InstantiableListener, Listener};
    use graft_core::EntityDescriptor;
    use graft_core::metamodel::LongType;

    #[derive(Debug, Default)]
    struct Veto;

    impl Listener for Veto {}

    impl InstantiableListener for Veto {
        fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Self)
        }
    }

    impl PreInsertEventListener for Veto {
        fn on_pre_insert(&self, _event: &mut PreInsertEvent) -> bool {
            true
        }
    }

    fn metamodel() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Tag")
                    .id("id", LongType)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_micros() > 1_600_000_000_000_000);
    }

    #[test]
    fn test_build_installs_defaults_then_configuration() {
        let factory = SessionFactory::builder(metamodel())
            .configure_listeners(|registry| {
                registry.append_listener_class::<_, Veto>(&PRE_INSERT)
            })
            .build()
            .unwrap();

        assert_eq!(factory.listeners().group(&MERGE).unwrap().len(), 1);
        assert_eq!(factory.listeners().group(&PRE_INSERT).unwrap().len(), 1);
        assert!(!factory.statistics().is_enabled());
        assert!(factory.settings().flush_before_commit);
    }

    #[test]
    fn test_statistics_follow_settings() {
        let settings = Settings {
            generate_statistics: true,
            ..Settings::default()
        };
        let factory = SessionFactory::builder(metamodel())
            .settings(settings)
            .build()
            .unwrap();
        assert!(factory.statistics().is_enabled());
        let session = factory.open_session();
        assert!(session.is_open());
    }
}
