//! Ownership scope for a client tree

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::client::Client;

/// Owns the nodes of one or more client trees and tears them down together
///
/// Closing the scope cancels every call, stream and port forward started
/// from its nodes, then closes the nodes in reverse build order so parents
/// go before their children.
pub struct Scope {
    cancel: CancellationToken,
    nodes: Mutex<Vec<Arc<dyn Client>>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// A scope nested under `parent`: closing the parent cancels this one
    pub fn child_of(parent: &Scope) -> Self {
        Self {
            cancel: parent.cancel.child_token(),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Token handed to nodes built in this scope
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Take ownership of fully built nodes, listed in build order
    pub fn adopt(&self, built: Vec<Arc<dyn Client>>) {
        match self.nodes.lock() {
            Ok(mut nodes) => nodes.extend(built),
            Err(poisoned) => poisoned.into_inner().extend(built),
        }
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        match self.nodes.lock() {
            Ok(nodes) => nodes.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel outstanding work and close every node, parents first
    pub fn close(&self) {
        self.cancel.cancel();
        let nodes = match self.nodes.lock() {
            Ok(mut nodes) => std::mem::take(&mut *nodes),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !nodes.is_empty() {
            tracing::debug!("Closing {} client nodes", nodes.len());
        }
        for node in nodes.iter().rev() {
            node.close();
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}
