// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The observable state tree.
//!
//! Every piece of state the library exposes lives in a hierarchical document
//! of typed nodes: the adapter root, its devices, their services and
//! characteristics. Each node carries a [`NodeKind`] tag and a map from
//! property name to typed [`Value`]. Hosts observe the tree through
//! listeners; the library publishes state by mutating it.
//!
//! Commands travel over the same tree: a command is a node of a command kind
//! that is appended under its target and immediately removed again (see
//! [`message`]). Listeners observe the child-added event and react; the
//! command never becomes part of persistent state.
//!
//! Listeners fire synchronously on the thread performing the mutation, in
//! registration order, and events propagate from the mutated node up through
//! its ancestors, so a single listener on the adapter root observes the
//! entire tree.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

/// Property names used by the tree records. These are part of the observable
/// contract: hosts match on them in their listeners.
pub mod keys {
    pub const STATUS: &str = "status";
    pub const NAME: &str = "name";
    pub const ADDRESS: &str = "address";
    pub const IS_CONNECTED: &str = "is_connected";
    pub const MAX_PDU_SIZE: &str = "max_pdu_size";
    pub const RSSI: &str = "rssi";
    pub const LAST_SEEN: &str = "last_seen";
    pub const UUID: &str = "uuid";
    pub const HANDLE_START: &str = "handle_start";
    pub const HANDLE_END: &str = "handle_end";
    pub const HANDLE: &str = "handle";
    pub const VALUE_HANDLE: &str = "value_handle";
    pub const PROPERTIES: &str = "properties";
    pub const CAN_WRITE_WITH_RESPONSE: &str = "can_write_with_response";
    pub const CAN_WRITE_WITHOUT_RESPONSE: &str = "can_write_without_response";
    pub const SHOULD_START: &str = "should_start";

    /// Backend-private opaque key locating the OS object for a service or
    /// characteristic record. Hosts should treat it as an implementation
    /// detail.
    pub const BACKEND_REF: &str = "backend_ref";
}

/// The type tag of a tree node. Record kinds persist in the tree; command
/// kinds only ever appear transiently (appended and immediately removed).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    Adapter,
    Device,
    Service,
    Characteristic,
    Scan,
    DiscoverServices,
    ServicesDiscovered,
    DiscoverCharacteristics,
    EnableNotifications,
    EnableIndications,
    NotificationsAreEnabled,
}

impl NodeKind {
    /// The wire name of the tag, as it appears to hosts.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Adapter => "BLUETOOTH_ADAPTER",
            NodeKind::Device => "BLUETOOTH_DEVICE",
            NodeKind::Service => "SERVICE",
            NodeKind::Characteristic => "CHARACTERISTIC",
            NodeKind::Scan => "SCAN",
            NodeKind::DiscoverServices => "DISCOVER_SERVICES",
            NodeKind::ServicesDiscovered => "SERVICES_DISCOVERED",
            NodeKind::DiscoverCharacteristics => "DISCOVER_CHARACTERISTICS",
            NodeKind::EnableNotifications => "ENABLE_NOTIFICATIONS",
            NodeKind::EnableIndications => "ENABLE_INDICATIONS",
            NodeKind::NotificationsAreEnabled => "NOTIFICATIONS_ARE_ENABLED",
        }
    }

    /// Whether nodes of this kind are transient messages rather than records.
    pub fn is_command(self) -> bool {
        !matches!(
            self,
            NodeKind::Adapter | NodeKind::Device | NodeKind::Service | NodeKind::Characteristic
        )
    }
}

/// A typed property value.
#[derive(Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Bytes(b) => write!(f, "{b:02x?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Handle returned by the listener registration methods, used to remove the
/// listener again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

// Listeners are shared `Fn`s rather than `FnMut`s: a callback may mutate the
// tree, which can synchronously re-enter the same callback (a listener
// reacting to SERVICES_DISCOVERED by sending DISCOVER_CHARACTERISTICS, for
// instance). Hosts keep mutable state behind their own cells.
type PropertyCallback = dyn Fn(&TreeNode, &'static str) + Send + Sync;
type ChildCallback = dyn Fn(&TreeNode, &TreeNode) + Send + Sync;

enum ListenerKind {
    PropertyChanged(Box<PropertyCallback>),
    ChildAdded(Box<ChildCallback>),
    ChildRemoved(Box<ChildCallback>),
}

struct ListenerEntry {
    id: ListenerId,
    kind: Arc<ListenerKind>,
}

struct NodeInner {
    kind: NodeKind,
    props: Mutex<BTreeMap<&'static str, Value>>,
    parent: Mutex<Weak<NodeInner>>,
    children: Mutex<Vec<TreeNode>>,
    listeners: Mutex<Vec<ListenerEntry>>,
}

/// A cheaply cloneable handle to a node of the state tree. Clones refer to
/// the same underlying node.
#[derive(Clone)]
pub struct TreeNode {
    inner: Arc<NodeInner>,
}

impl TreeNode {
    /// Create a new detached node of the given kind.
    pub fn new(kind: NodeKind) -> Self {
        TreeNode {
            inner: Arc::new(NodeInner {
                kind,
                props: Mutex::new(BTreeMap::new()),
                parent: Mutex::new(Weak::new()),
                children: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.inner.kind
    }

    pub fn has_type(&self, kind: NodeKind) -> bool {
        self.inner.kind == kind
    }

    /// Whether two handles refer to the same node.
    pub fn is_same_node(&self, other: &TreeNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn parent(&self) -> Option<TreeNode> {
        self.inner
            .parent
            .lock()
            .unwrap()
            .upgrade()
            .map(|inner| TreeNode { inner })
    }

    /// Walk up from this node's parent and return the first ancestor of the
    /// given kind.
    pub fn find_ancestor(&self, kind: NodeKind) -> Option<TreeNode> {
        let mut node = self.parent();
        while let Some(n) = node {
            if n.has_type(kind) {
                return Some(n);
            }
            node = n.parent();
        }
        None
    }

    /// Snapshot of this node's children, in insertion order.
    pub fn children(&self) -> Vec<TreeNode> {
        self.inner.children.lock().unwrap().clone()
    }

    pub fn children_of_kind(&self, kind: NodeKind) -> Vec<TreeNode> {
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.has_type(kind))
            .cloned()
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.inner.children.lock().unwrap().len()
    }

    pub fn get_property(&self, key: &str) -> Option<Value> {
        self.inner.props.lock().unwrap().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_property(key).and_then(|v| v.as_bool())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_property(key).and_then(|v| v.as_int())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_property(key)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get_property(key).and_then(|v| v.as_uuid())
    }

    /// Set a property, notifying listeners if the stored value changed.
    pub fn set_property(&self, key: &'static str, value: impl Into<Value>) {
        let value = value.into();
        {
            let mut props = self.inner.props.lock().unwrap();
            if props.get(key) == Some(&value) {
                return;
            }
            props.insert(key, value);
        }
        notify_property_changed(self, key);
    }

    /// Append a child node. The child must currently be detached.
    pub fn append_child(&self, child: &TreeNode) {
        debug_assert!(
            child.parent().is_none(),
            "appending a child that is already attached"
        );
        *child.inner.parent.lock().unwrap() = Arc::downgrade(&self.inner);
        self.inner.children.lock().unwrap().push(child.clone());
        notify_child_event(self, child, ChildEvent::Added);
    }

    /// Remove a child node. Removing a node that is not a child is a no-op.
    pub fn remove_child(&self, child: &TreeNode) {
        let removed = {
            let mut children = self.inner.children.lock().unwrap();
            match children.iter().position(|c| c.is_same_node(child)) {
                Some(index) => {
                    children.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            *child.inner.parent.lock().unwrap() = Weak::new();
            notify_child_event(self, child, ChildEvent::Removed);
        }
    }

    /// Return the first child whose property `key` equals `value`.
    pub fn get_child_with_property(&self, key: &str, value: impl Into<Value>) -> Option<TreeNode> {
        let value = value.into();
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.get_property(key).as_ref() == Some(&value))
            .cloned()
    }

    pub fn on_property_changed(
        &self,
        callback: impl Fn(&TreeNode, &'static str) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(ListenerKind::PropertyChanged(Box::new(callback)))
    }

    /// Register a callback invoked as `(parent, added_child)` for additions
    /// in this node's subtree.
    pub fn on_child_added(
        &self,
        callback: impl Fn(&TreeNode, &TreeNode) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(ListenerKind::ChildAdded(Box::new(callback)))
    }

    /// Register a callback invoked as `(parent, removed_child)` for removals
    /// in this node's subtree.
    pub fn on_child_removed(
        &self,
        callback: impl Fn(&TreeNode, &TreeNode) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(ListenerKind::ChildRemoved(Box::new(callback)))
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|entry| entry.id != id);
    }

    fn add_listener(&self, kind: ListenerKind) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().unwrap().push(ListenerEntry {
            id,
            kind: Arc::new(kind),
        });
        id
    }

    fn snapshot_listeners(&self) -> Vec<Arc<ListenerKind>> {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.kind.clone())
            .collect()
    }

    fn self_and_ancestors(&self) -> Vec<TreeNode> {
        let mut nodes = vec![self.clone()];
        let mut node = self.parent();
        while let Some(n) = node {
            node = n.parent();
            nodes.push(n);
        }
        nodes
    }

    fn fmt_indented(&self, f: &mut Formatter, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let props = self.inner.props.lock().unwrap().clone();
        write!(f, "{indent}{}", self.kind().as_str())?;
        for (key, value) in &props {
            write!(f, " {key}={value:?}")?;
        }
        writeln!(f)?;
        for child in self.children() {
            child.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl Debug for TreeNode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

enum ChildEvent {
    Added,
    Removed,
}

// Listener snapshots are taken per node with no lock held during invocation,
// so callbacks may freely mutate the tree, re-enter themselves, or change
// the listener lists.
fn notify_property_changed(origin: &TreeNode, key: &'static str) {
    for node in origin.self_and_ancestors() {
        for listener in node.snapshot_listeners() {
            if let ListenerKind::PropertyChanged(callback) = &*listener {
                callback(origin, key);
            }
        }
    }
}

fn notify_child_event(parent: &TreeNode, child: &TreeNode, event: ChildEvent) {
    for node in parent.self_and_ancestors() {
        for listener in node.snapshot_listeners() {
            match (&event, &*listener) {
                (ChildEvent::Added, ListenerKind::ChildAdded(callback))
                | (ChildEvent::Removed, ListenerKind::ChildRemoved(callback)) => {
                    callback(parent, child);
                }
                _ => {}
            }
        }
    }
}

/// Deliver a transient message node under `receiver`: the node is appended
/// and immediately removed, so listeners observe the child-added event but
/// the tree is left unchanged.
pub fn message_with(receiver: &TreeNode, node: TreeNode) {
    receiver.append_child(&node);
    receiver.remove_child(&node);
}

/// Deliver an empty transient message of the given kind under `receiver`.
pub fn message(receiver: &TreeNode, kind: NodeKind) {
    message_with(receiver, TreeNode::new(kind));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn properties_are_typed_and_replaceable() {
        let node = TreeNode::new(NodeKind::Device);
        node.set_property(keys::ADDRESS, "AA:BB:CC:DD:EE:FF");
        node.set_property(keys::RSSI, -54i64);
        node.set_property(keys::IS_CONNECTED, false);

        assert_eq!(
            node.get_string(keys::ADDRESS).as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(node.get_int(keys::RSSI), Some(-54));
        assert_eq!(node.get_bool(keys::IS_CONNECTED), Some(false));
        assert_eq!(node.get_int(keys::ADDRESS), None);

        node.set_property(keys::RSSI, -60i64);
        assert_eq!(node.get_int(keys::RSSI), Some(-60));
    }

    #[test]
    fn property_listener_skips_unchanged_values() {
        let node = TreeNode::new(NodeKind::Device);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        node.on_property_changed(move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        node.set_property(keys::RSSI, -54i64);
        node.set_property(keys::RSSI, -54i64);
        node.set_property(keys::RSSI, -55i64);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn events_propagate_to_ancestors() {
        let root = TreeNode::new(NodeKind::Adapter);
        let device = TreeNode::new(NodeKind::Device);
        root.append_child(&device);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        root.on_property_changed(move |origin, key| {
            seen_clone
                .lock()
                .unwrap()
                .push((origin.kind(), key.to_owned()));
        });

        let service = TreeNode::new(NodeKind::Service);
        device.append_child(&service);
        service.set_property(keys::UUID, Uuid::nil());

        let seen = seen.lock().unwrap();
        assert_eq!(&*seen, &[(NodeKind::Service, keys::UUID.to_owned())]);
    }

    #[test]
    fn child_added_reports_parent_and_child() {
        let root = TreeNode::new(NodeKind::Adapter);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        root.on_child_added(move |parent, child| {
            seen_clone
                .lock()
                .unwrap()
                .push((parent.kind(), child.kind()));
        });

        let device = TreeNode::new(NodeKind::Device);
        root.append_child(&device);
        let service = TreeNode::new(NodeKind::Service);
        device.append_child(&service);

        let seen = seen.lock().unwrap();
        assert_eq!(
            &*seen,
            &[
                (NodeKind::Adapter, NodeKind::Device),
                (NodeKind::Device, NodeKind::Service),
            ]
        );
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let node = TreeNode::new(NodeKind::Adapter);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            node.on_child_added(move |_, _| order.lock().unwrap().push(tag));
        }
        node.append_child(&TreeNode::new(NodeKind::Device));
        assert_eq!(&*order.lock().unwrap(), &["first", "second", "third"]);
    }

    #[test]
    fn removed_listener_no_longer_fires() {
        let node = TreeNode::new(NodeKind::Adapter);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let id = node.on_child_added(move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        node.append_child(&TreeNode::new(NodeKind::Device));
        node.remove_listener(id);
        node.append_child(&TreeNode::new(NodeKind::Device));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_lookup_by_property() {
        let root = TreeNode::new(NodeKind::Adapter);
        for address in ["AA:AA:AA:AA:AA:AA", "BB:BB:BB:BB:BB:BB"] {
            let device = TreeNode::new(NodeKind::Device);
            device.set_property(keys::ADDRESS, address);
            root.append_child(&device);
        }

        let found = root
            .get_child_with_property(keys::ADDRESS, "BB:BB:BB:BB:BB:BB")
            .unwrap();
        assert_eq!(
            found.get_string(keys::ADDRESS).as_deref(),
            Some("BB:BB:BB:BB:BB:BB")
        );
        assert!(root
            .get_child_with_property(keys::ADDRESS, "CC:CC:CC:CC:CC:CC")
            .is_none());
    }

    #[test]
    fn ancestor_lookup_by_kind() {
        let root = TreeNode::new(NodeKind::Adapter);
        let device = TreeNode::new(NodeKind::Device);
        let service = TreeNode::new(NodeKind::Service);
        let characteristic = TreeNode::new(NodeKind::Characteristic);
        root.append_child(&device);
        device.append_child(&service);
        service.append_child(&characteristic);

        let found = characteristic.find_ancestor(NodeKind::Device).unwrap();
        assert!(found.is_same_node(&device));
        assert!(characteristic.find_ancestor(NodeKind::Scan).is_none());
    }

    #[test]
    fn message_is_transient() {
        let root = TreeNode::new(NodeKind::Adapter);
        let device = TreeNode::new(NodeKind::Device);
        root.append_child(&device);

        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(AtomicUsize::new(0));
        let added_clone = added.clone();
        let removed_clone = removed.clone();
        root.on_child_added(move |parent, child| {
            added_clone
                .lock()
                .unwrap()
                .push((parent.kind(), child.kind()));
        });
        root.on_child_removed(move |_, _| {
            removed_clone.fetch_add(1, Ordering::SeqCst);
        });

        message(&device, NodeKind::DiscoverServices);

        assert_eq!(
            &*added.lock().unwrap(),
            &[(NodeKind::Device, NodeKind::DiscoverServices)]
        );
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(device.child_count(), 0);
    }

    #[test]
    fn listeners_may_reenter_the_tree() {
        let root = TreeNode::new(NodeKind::Adapter);
        let device = TreeNode::new(NodeKind::Device);
        root.append_child(&device);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let device_clone = device.clone();
        root.on_child_added(move |_, child| {
            seen_clone.lock().unwrap().push(child.kind());
            // Reacting to a completion message with a follow-up command
            // re-enters this very listener.
            if child.has_type(NodeKind::ServicesDiscovered) {
                message(&device_clone, NodeKind::DiscoverCharacteristics);
            }
        });

        message(&device, NodeKind::ServicesDiscovered);
        assert_eq!(
            &*seen.lock().unwrap(),
            &[
                NodeKind::ServicesDiscovered,
                NodeKind::DiscoverCharacteristics
            ]
        );
    }

    #[test]
    fn detached_child_loses_parent() {
        let root = TreeNode::new(NodeKind::Adapter);
        let device = TreeNode::new(NodeKind::Device);
        root.append_child(&device);
        assert!(device.parent().is_some());

        root.remove_child(&device);
        assert!(device.parent().is_none());
        // Removing again is a no-op.
        root.remove_child(&device);
        assert_eq!(root.child_count(), 0);
    }
}
