// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Starts registered components in declared order, shuts them down in
//! reverse with a deadline, and tracks per-component state.

use crate::bus::{BusEvent, EventBus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    pub status: Status,
    pub started_at: Option<jiff::Timestamp>,
    pub last_error: Option<String>,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState {
            status: Status::Stopped,
            started_at: None,
            last_error: None,
        }
    }
}

/// Cancellation signal handed to every component. Cloning shares the same token.
#[derive(Clone)]
pub struct CancelToken(base::shutdown::Receiver);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.check().is_err()
    }

    pub async fn cancelled(&self) {
        self.0.clone().into_future().await
    }
}

/// Context passed to every component at start/stop.
pub struct Context {
    pub cancel: CancelToken,
    pub bus: EventBus,
}

/// `start` takes `self: Arc<Self>` rather than `&self` so components that run a background loop
/// for their whole lifetime can spawn it as a task, hand back a join handle internally, and
/// return quickly — `start_all` applies a timeout to `start` itself, not to the service's
/// lifetime, so a `start` that never returns would always time out.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(self: Arc<Self>, ctx: &Context) -> Result<(), base::Error>;
    async fn stop(&self, ctx: &Context) -> Result<(), base::Error>;
}

struct Registered {
    component: Arc<dyn Component>,
    start_timeout: Duration,
}

pub struct Supervisor {
    components: Vec<Registered>,
    states: Arc<Mutex<HashMap<&'static str, ServiceState>>>,
    bus: EventBus,
    shutdown_tx: Option<base::shutdown::Sender>,
    cancel: CancelToken,
    started: Vec<usize>,
}

impl Supervisor {
    pub fn new(bus: EventBus) -> Self {
        let (tx, rx) = base::shutdown::channel();
        Supervisor {
            components: Vec::new(),
            states: Arc::new(Mutex::new(HashMap::new())),
            bus,
            shutdown_tx: Some(tx),
            cancel: CancelToken(rx),
            started: Vec::new(),
        }
    }

    pub fn register(&mut self, component: Arc<dyn Component>, start_timeout: Duration) {
        self.states
            .lock()
            .insert(component.name(), ServiceState::default());
        self.components.push(Registered {
            component,
            start_timeout,
        });
    }

    pub fn get_status(&self, name: &str) -> Option<ServiceState> {
        self.states.lock().get(name).cloned()
    }

    fn context(&self) -> Context {
        Context {
            cancel: self.cancel.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Starts every registered component in registration order. A component's failure is
    /// recorded on its own `ServiceState` and logged, but does not prevent later components
    /// from starting.
    pub async fn start_all(&mut self) {
        let ctx = self.context();
        for (i, reg) in self.components.iter().enumerate() {
            let name = reg.component.name();
            self.states.lock().insert(
                name,
                ServiceState {
                    status: Status::Starting,
                    started_at: None,
                    last_error: None,
                },
            );
            info!(component = name, "starting component");
            let result = tokio::time::timeout(reg.start_timeout, reg.component.clone().start(&ctx)).await;
            let state = match result {
                Ok(Ok(())) => {
                    self.started.push(i);
                    info!(component = name, "component running");
                    ServiceState {
                        status: Status::Running,
                        started_at: Some(jiff::Timestamp::now()),
                        last_error: None,
                    }
                }
                Ok(Err(e)) => {
                    error!(component = name, err = %e.chain(), "component failed to start");
                    ServiceState {
                        status: Status::Error,
                        started_at: None,
                        last_error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    error!(component = name, "component start timed out");
                    ServiceState {
                        status: Status::Error,
                        started_at: None,
                        last_error: Some("start timed out".to_owned()),
                    }
                }
            };
            self.states.lock().insert(name, state);
            self.bus.publish(BusEvent::ServiceStarted { component: name });
        }
    }

    /// Shuts down successfully-started components in reverse order, racing a global deadline.
    /// Components not reached before the deadline are marked `error` with a shutdown-timeout
    /// note; the supervisor always returns rather than blocking forever.
    pub async fn shutdown(mut self, global_deadline: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            drop(tx);
        }
        let ctx = self.context();
        let deadline = tokio::time::Instant::now() + global_deadline;
        while let Some(i) = self.started.pop() {
            let reg = &self.components[i];
            let name = reg.component.name();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(component = name, "shutdown deadline exceeded before stop attempted");
                self.states.lock().insert(
                    name,
                    ServiceState {
                        status: Status::Error,
                        started_at: None,
                        last_error: Some("shutdown-timeout".to_owned()),
                    },
                );
                continue;
            }
            self.states.lock().insert(
                name,
                ServiceState {
                    status: Status::Stopping,
                    started_at: None,
                    last_error: None,
                },
            );
            match tokio::time::timeout(remaining, reg.component.stop(&ctx)).await {
                Ok(Ok(())) => {
                    info!(component = name, "component stopped");
                    self.states.lock().insert(name, ServiceState::default());
                    self.bus.publish(BusEvent::ServiceStopped { component: name });
                }
                Ok(Err(e)) => {
                    error!(component = name, err = %e.chain(), "component failed to stop cleanly");
                    self.states.lock().insert(
                        name,
                        ServiceState {
                            status: Status::Error,
                            started_at: None,
                            last_error: Some(e.to_string()),
                        },
                    );
                }
                Err(_) => {
                    warn!(component = name, "component stop timed out");
                    self.states.lock().insert(
                        name,
                        ServiceState {
                            status: Status::Error,
                            started_at: None,
                            last_error: Some("shutdown-timeout".to_owned()),
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Component for Dummy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(self: Arc<Self>, _ctx: &Context) -> Result<(), base::Error> {
            self.order.lock().push(self.name);
            if self.fail_start {
                return Err(base::Error::msg(base::ErrorKind::Internal, "boom"));
            }
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), base::Error> {
            self.order.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_in_order_stops_in_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut sup = Supervisor::new(EventBus::new());
        sup.register(
            Arc::new(Dummy { name: "a", order: order.clone(), fail_start: false }),
            Duration::from_secs(1),
        );
        sup.register(
            Arc::new(Dummy { name: "b", order: order.clone(), fail_start: false }),
            Duration::from_secs(1),
        );
        sup.start_all().await;
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(sup.get_status("a").unwrap().status, Status::Running);

        order.lock().clear();
        sup.shutdown(Duration::from_secs(5)).await;
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn failed_component_does_not_abort_remaining_starts() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut sup = Supervisor::new(EventBus::new());
        sup.register(
            Arc::new(Dummy { name: "a", order: order.clone(), fail_start: true }),
            Duration::from_secs(1),
        );
        sup.register(
            Arc::new(Dummy { name: "b", order: order.clone(), fail_start: false }),
            Duration::from_secs(1),
        );
        sup.start_all().await;
        assert_eq!(sup.get_status("a").unwrap().status, Status::Error);
        assert_eq!(sup.get_status("b").unwrap().status, Status::Running);

        order.lock().clear();
        // "a" never successfully started, so reverse shutdown only stops "b".
        sup.shutdown(Duration::from_secs(5)).await;
        assert_eq!(*order.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn shutdown_deadline_marks_remaining_components_error() {
        struct Slow(Arc<AtomicUsize>);
        #[async_trait]
        impl Component for Slow {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn start(self: Arc<Self>, _ctx: &Context) -> Result<(), base::Error> {
                Ok(())
            }
            async fn stop(&self, _ctx: &Context) -> Result<(), base::Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }
        let mut sup = Supervisor::new(EventBus::new());
        sup.register(Arc::new(Slow(Arc::new(AtomicUsize::new(0)))), Duration::from_secs(1));
        sup.start_all().await;
        sup.shutdown(Duration::from_millis(10)).await;
        assert_eq!(sup.get_status("slow").unwrap().status, Status::Error);
    }
}
