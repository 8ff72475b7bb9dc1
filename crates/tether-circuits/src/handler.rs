//! Application hooks into the circuit lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{CircuitId, ConnectionId};
use tracing::warn;

/// Receives lifecycle notifications for every circuit.
///
/// All hooks default to no-ops. Handlers run in ascending [`order`](Self::order).
#[async_trait]
pub trait CircuitHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Sort key; lower runs first.
    fn order(&self) -> i32 {
        0
    }

    /// A circuit was created and is initializing.
    async fn on_circuit_opened(&self, _circuit_id: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    /// A connection was bound to the circuit (initial start or reconnect).
    async fn on_connection_up(
        &self,
        _circuit_id: &CircuitId,
        _connection_id: &ConnectionId,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The bound connection went away.
    async fn on_connection_down(
        &self,
        _circuit_id: &CircuitId,
        _connection_id: &ConnectionId,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The circuit terminated.
    async fn on_circuit_closed(&self, _circuit_id: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of handlers shared by every circuit.
#[derive(Clone, Default)]
pub struct CircuitHandlers {
    handlers: Vec<Arc<dyn CircuitHandler>>,
}

#[derive(Clone, Copy)]
enum Hook {
    Opened,
    Up,
    Down,
    Closed,
}

impl Hook {
    fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "on_circuit_opened",
            Self::Up => "on_connection_up",
            Self::Down => "on_connection_down",
            Self::Closed => "on_circuit_closed",
        }
    }
}

impl CircuitHandlers {
    /// Build from handlers in any order.
    pub fn new(mut handlers: Vec<Arc<dyn CircuitHandler>>) -> Self {
        handlers.sort_by_key(|h| h.order());
        Self { handlers }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `on_circuit_opened` on every handler.
    pub async fn circuit_opened(&self, circuit_id: &CircuitId) -> anyhow::Result<()> {
        self.run(Hook::Opened, circuit_id, None).await
    }

    /// Run `on_connection_up` on every handler.
    pub async fn connection_up(
        &self,
        circuit_id: &CircuitId,
        connection_id: &ConnectionId,
    ) -> anyhow::Result<()> {
        self.run(Hook::Up, circuit_id, Some(connection_id)).await
    }

    /// Run `on_connection_down` on every handler.
    pub async fn connection_down(
        &self,
        circuit_id: &CircuitId,
        connection_id: &ConnectionId,
    ) -> anyhow::Result<()> {
        self.run(Hook::Down, circuit_id, Some(connection_id)).await
    }

    /// Run `on_circuit_closed` on every handler.
    pub async fn circuit_closed(&self, circuit_id: &CircuitId) -> anyhow::Result<()> {
        self.run(Hook::Closed, circuit_id, None).await
    }

    /// Every handler runs even if an earlier one fails; failures are logged
    /// individually and returned together.
    async fn run(
        &self,
        hook: Hook,
        circuit_id: &CircuitId,
        connection_id: Option<&ConnectionId>,
    ) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for handler in &self.handlers {
            let result = match (hook, connection_id) {
                (Hook::Opened, _) => handler.on_circuit_opened(circuit_id).await,
                (Hook::Closed, _) => handler.on_circuit_closed(circuit_id).await,
                (Hook::Up, Some(conn)) => handler.on_connection_up(circuit_id, conn).await,
                (Hook::Down, Some(conn)) => handler.on_connection_down(circuit_id, conn).await,
                (Hook::Up | Hook::Down, None) => Ok(()),
            };
            if let Err(e) = result {
                warn!(
                    circuit_id = %circuit_id,
                    handler = handler.name(),
                    hook = hook.as_str(),
                    error = %e,
                    "circuit handler failed"
                );
                failures.push(format!("{}: {e:#}", handler.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} circuit handler(s) failed in {}: {}",
                failures.len(),
                hook.as_str(),
                failures.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        label: &'static str,
        order: i32,
        fail_opened: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CircuitHandler for Recording {
        fn name(&self) -> &str {
            self.label
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn on_circuit_opened(&self, _circuit_id: &CircuitId) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:opened", self.label));
            if self.fail_opened {
                anyhow::bail!("refused");
            }
            Ok(())
        }

        async fn on_connection_up(
            &self,
            _circuit_id: &CircuitId,
            connection_id: &ConnectionId,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:up:{connection_id}", self.label));
            Ok(())
        }
    }

    fn recording(
        label: &'static str,
        order: i32,
        fail_opened: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn CircuitHandler> {
        Arc::new(Recording {
            label,
            order,
            fail_opened,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = CircuitHandlers::new(vec![
            recording("second", 10, false, &log),
            recording("first", -1, false, &log),
        ]);
        let id = CircuitId::from("c1");
        handlers.circuit_opened(&id).await.unwrap();
        handlers
            .connection_up(&id, &ConnectionId::from("conn"))
            .await
            .unwrap();
        assert_eq!(
            *log.lock(),
            vec!["first:opened", "second:opened", "first:up:conn", "second:up:conn"]
        );
    }

    #[tokio::test]
    async fn failures_are_aggregated_after_all_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = CircuitHandlers::new(vec![
            recording("a", 0, true, &log),
            recording("b", 1, true, &log),
            recording("c", 2, false, &log),
        ]);
        let err = handlers
            .circuit_opened(&CircuitId::from("c1"))
            .await
            .unwrap_err();
        assert_eq!(log.lock().len(), 3);
        let message = err.to_string();
        assert!(message.starts_with("2 circuit handler(s) failed"));
        assert!(message.contains("a: refused"));
        assert!(message.contains("b: refused"));
    }

    #[tokio::test]
    async fn empty_set_is_noop() {
        let handlers = CircuitHandlers::default();
        assert!(handlers.is_empty());
        handlers
            .circuit_closed(&CircuitId::from("c1"))
            .await
            .unwrap();
    }
}
