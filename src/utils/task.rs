//! # Task management
//!
//! Keeps the long-running services of the supervisor organised on the
//! tokio runtime: every service is spawned under a named tracing span and
//! reports back when it terminates, so the main task can react to a dead
//! control loop instead of silently running degraded.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{span, Instrument, Level};

/// hold onto the different services created
pub struct Services {
    services: Vec<Service>,
    finish_sender: mpsc::UnboundedSender<&'static str>,
    finish_receiver: mpsc::UnboundedReceiver<&'static str>,
}

/// wrap up a service
pub struct Service {
    /// this is the name of the service task, useful for logging and
    /// following activity of a given task within the app
    name: &'static str,

    /// provides us with information regarding the up time of the Service
    up_time: Instant,
}

impl Services {
    pub fn new() -> Self {
        let (finish_sender, finish_receiver) = mpsc::unbounded_channel();
        Services {
            services: Vec::new(),
            finish_sender,
            finish_receiver,
        }
    }

    /// Spawn the given future as a named service on the runtime.
    pub fn spawn_future<F, T>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce() -> T,
        T: Future<Output = ()> + Send + 'static,
    {
        let finish_notifier = self.finish_sender.clone();
        let future = f();
        tokio::spawn(
            async move {
                future.await;
                // a service future never resolves in normal operation; let
                // the main task decide what a finished service means
                let _ = finish_notifier.send(name);
            }
            .instrument(span!(Level::TRACE, "task", kind = name)),
        );
        self.services.push(Service::new(name, Instant::now()));
    }

    /// Wait until the first service terminates and return its name.
    pub async fn wait_any_finished(&mut self) -> Option<&'static str> {
        self.finish_receiver.recv().await
    }

    /// How long the given service has been running, if it was spawned here.
    pub fn up_time(&self, name: &str) -> Option<Duration> {
        self.services
            .iter()
            .find(|service| service.name() == name)
            .map(Service::up_time)
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    /// get the time this service has been running since
    #[inline]
    pub fn up_time(&self) -> Duration {
        Instant::now().duration_since(self.up_time)
    }

    /// get the name of this Service
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn new(name: &'static str, now: Instant) -> Self {
        Service { name, up_time: now }
    }
}
