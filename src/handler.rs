// -----------------------------------------------------------------------------
// Application message handlers
// -----------------------------------------------------------------------------
//
// Anything that is not a mesh system type is handed to the handler registered
// for its type. A handler declares its types once, at registration, and gets a
// non-owning MeshHandle back to the node for sending and broadcasting.
// -----------------------------------------------------------------------------

use crate::constants::{is_reserved, MSG_TEST};
use crate::error::{MeshError, Result};
use crate::p2p::MeshNode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Optional answer to a delivered message, sent back to its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: String,
    pub contents: Value,
}

impl Reply {
    pub fn new(kind: &str, contents: Value) -> Self {
        Reply {
            kind: kind.to_string(),
            contents,
        }
    }
}

pub trait MessageHandler: Send + Sync {
    fn message_types(&self) -> Vec<String>;

    fn handle_message(
        &self,
        mesh: &MeshHandle,
        sender: &str,
        kind: &str,
        contents: &Value,
    ) -> Option<Reply>;
}

/// Send/broadcast capability given to handlers. Holds the node weakly, so a
/// handler never keeps a stopped node alive.
#[derive(Clone)]
pub struct MeshHandle {
    node: Weak<MeshNode>,
}

impl MeshHandle {
    pub(crate) fn new(node: &Arc<MeshNode>) -> Self {
        MeshHandle {
            node: Arc::downgrade(node),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.node.upgrade().map(|n| n.name().to_string())
    }

    pub async fn send_message(&self, peer: &str, kind: &str, contents: Value) -> bool {
        match self.node.upgrade() {
            Some(node) => node.send_message(peer, kind, contents).await,
            None => false,
        }
    }

    pub async fn broadcast(&self, kind: &str, contents: Value) -> usize {
        match self.node.upgrade() {
            Some(node) => node.broadcast(kind, contents).await,
            None => 0,
        }
    }
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All of the handler's types are checked before any is claimed, so a
    /// rejected handler leaves the registry untouched.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let types = handler.message_types();
        for kind in &types {
            if is_reserved(kind) {
                return Err(MeshError::ReservedType(kind.clone()));
            }
            if self.by_type.contains_key(kind) {
                return Err(MeshError::DuplicateHandler(kind.clone()));
            }
        }
        for kind in types {
            self.by_type.insert(kind, Arc::clone(&handler));
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.by_type.get(kind).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }
}

// -----------------------------------------------------------------------------
// ConsoleHandler
// -----------------------------------------------------------------------------

/// Logs the `test` messages other nodes broadcast from their console.
pub struct ConsoleHandler;

impl MessageHandler for ConsoleHandler {
    fn message_types(&self) -> Vec<String> {
        vec![MSG_TEST.to_string()]
    }

    fn handle_message(
        &self,
        mesh: &MeshHandle,
        sender: &str,
        kind: &str,
        contents: &Value,
    ) -> Option<Reply> {
        log::info!(
            "[{}] 💬 {} from [{}]: {}",
            mesh.name().unwrap_or_default(),
            kind,
            sender,
            contents
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Vec<&'static str>);

    impl MessageHandler for Fixed {
        fn message_types(&self) -> Vec<String> {
            self.0.iter().map(|s| s.to_string()).collect()
        }

        fn handle_message(&self, _: &MeshHandle, _: &str, _: &str, _: &Value) -> Option<Reply> {
            None
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fixed(vec!["move", "chat"]))).unwrap();
        assert!(registry.get("move").is_some());
        assert!(registry.get("tag").is_none());
        assert_eq!(registry.types(), vec!["chat", "move"]);
    }

    #[test]
    fn test_duplicate_type_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fixed(vec!["move"]))).unwrap();

        let err = registry.register(Arc::new(Fixed(vec!["tag", "move"]))).unwrap_err();
        assert!(matches!(err, MeshError::DuplicateHandler(ref t) if t == "move"));
        // nothing from the rejected handler was claimed
        assert!(registry.get("tag").is_none());
    }

    #[test]
    fn test_reserved_type_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let err = registry.register(Arc::new(Fixed(vec!["ping"]))).unwrap_err();
        assert!(matches!(err, MeshError::ReservedType(_)));
    }

    #[tokio::test]
    async fn test_handle_outliving_node() {
        let handle = MeshHandle { node: Weak::new() };
        assert_eq!(handle.name(), None);
        assert!(!handle.send_message("bravo", "move", json!({})).await);
        assert_eq!(handle.broadcast("move", json!({})).await, 0);

        let reply = ConsoleHandler.handle_message(&handle, "bravo", MSG_TEST, &json!("hi"));
        assert!(reply.is_none());
    }
}
