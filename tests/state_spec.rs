use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use planet_admin::models::*;
use planet_admin::state::{ListenerControl, Slot, StateError, StateListener, StateTree};
use proptest::prelude::*;
use serde_json::json;
use speculate2::speculate;

fn planet_snapshot() -> Snapshot {
    Snapshot {
        root: 1,
        nodes: vec![
            NodeSnapshot::new(1, NodeKind::Planet)
                .attr("name", "planet")
                .child("atmosphere", 2)
                .list("flows", vec![StateValue::Node(3)])
                .dict("messages"),
            NodeSnapshot::new(2, NodeKind::Atmosphere)
                .attr("name", "atmosphere")
                .list("components", vec![]),
            NodeSnapshot::new(3, NodeKind::Flow)
                .attr("name", "default")
                .list("components", vec![StateValue::Node(10)]),
            NodeSnapshot::new(10, NodeKind::Component)
                .attr("name", "producer")
                .attr("mood", "happy"),
        ],
        seq: None,
    }
}

/// Records every callback it receives, in order.
#[derive(Default)]
struct Recorder {
    tag: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: String) -> ListenerControl {
        self.events.lock().push(format!("{}:{}", self.tag, event));
        ListenerControl::Keep
    }
}

impl StateListener for Recorder {
    fn state_set(&self, _: &StateTree, _: NodeId, key: &str, value: &StateValue) -> ListenerControl {
        self.push(format!("set {} {:?}", key, value.as_str()))
    }

    fn state_append(&self, _: &StateTree, _: NodeId, key: &str, _: &StateValue) -> ListenerControl {
        self.push(format!("append {}", key))
    }

    fn state_remove(&self, tree: &StateTree, _: NodeId, key: &str, value: &StateValue) -> ListenerControl {
        let readable = value.as_node().is_some_and(|id| tree.contains(id));
        self.push(format!("remove {} readable={}", key, readable))
    }

    fn node_destroyed(&self, node: NodeId) {
        self.events.lock().push(format!("{}:destroyed {}", self.tag, node));
    }
}

/// One node's contents, rebuilt independently from the same deltas.
#[derive(Debug, Default, PartialEq)]
struct ReferenceNode {
    values: BTreeMap<String, serde_json::Value>,
    lists: BTreeMap<String, Vec<serde_json::Value>>,
    dicts: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl ReferenceNode {
    fn replay(&mut self, change: &Change) {
        match change {
            Change::Set { key, value } => {
                self.values.insert(key.clone(), value.as_scalar().cloned().unwrap_or_default());
            }
            Change::Append { key, value } => self
                .lists
                .entry(key.clone())
                .or_default()
                .push(value.as_scalar().cloned().unwrap_or_default()),
            Change::Remove { key, value } => {
                if let Some(items) = self.lists.get_mut(key) {
                    let scalar = value.as_scalar().cloned().unwrap_or_default();
                    if let Some(pos) = items.iter().position(|v| *v == scalar) {
                        items.remove(pos);
                    }
                }
            }
            Change::SetItem { key, subkey, value } => {
                self.dicts
                    .entry(key.clone())
                    .or_default()
                    .insert(subkey.clone(), value.clone());
            }
            Change::DelItem { key, subkey } => {
                if let Some(items) = self.dicts.get_mut(key) {
                    items.remove(subkey);
                }
            }
        }
    }

    fn observe(tree: &StateTree, id: NodeId) -> Self {
        let node = tree.node(id).expect("node exists");
        let mut observed = Self::default();
        for key in node.keys() {
            match node.slot(key).expect("key listed") {
                Slot::Value(v) => {
                    observed.values.insert(key.to_string(), v.as_scalar().cloned().unwrap_or_default());
                }
                Slot::List(items) => {
                    observed.lists.insert(
                        key.to_string(),
                        items.iter().map(|v| v.as_scalar().cloned().unwrap_or_default()).collect(),
                    );
                }
                Slot::Dict(items) => {
                    observed.dicts.insert(key.to_string(), items.clone());
                }
            }
        }
        observed
    }
}

prop_compose! {
    fn key(prefix: &'static str)(n in 0..4u8) -> String {
        format!("{}{}", prefix, n)
    }
}

/// Changes confined to one node; each key prefix keeps to one slot kind.
fn change_strategy() -> impl Strategy<Value = Change> {
    prop_oneof![
        (key("attr"), 0..100u64).prop_map(|(key, v)| Change::Set {
            key,
            value: json!(v).into(),
        }),
        (key("list"), 0..5u64).prop_map(|(key, v)| Change::Append {
            key,
            value: json!(v).into(),
        }),
        (key("list"), 0..5u64).prop_map(|(key, v)| Change::Remove {
            key,
            value: json!(v).into(),
        }),
        (key("dict"), key("k"), 0..100u64).prop_map(|(key, subkey, v)| Change::SetItem {
            key,
            subkey,
            value: json!(v),
        }),
        (key("dict"), key("k")).prop_map(|(key, subkey)| Change::DelItem { key, subkey }),
    ]
}

speculate! {
    before {
        let mut tree = StateTree::new();
        tree.load(planet_snapshot()).expect("Failed to load planet");
    }

    describe "load and query" {
        it "wires parent back-references" {
            assert_eq!(tree.node(10).unwrap().parent(), Some(3));
            assert_eq!(tree.node(3).unwrap().parent(), Some(1));
            assert_eq!(tree.node(1).unwrap().parent(), None);
        }

        it "finds components by path" {
            let producer = tree.query(1, "flows/default/components/producer").unwrap();
            assert_eq!(producer.id(), 10);
            assert_eq!(tree.query(1, "atmosphere").unwrap().id(), 2);
        }

        it "reports unknown paths" {
            assert_eq!(
                tree.query(1, "flows/other").unwrap_err(),
                StateError::NotFound("flows/other".into())
            );
        }

        it "exports the same subtree it loaded" {
            let mut exported = tree.snapshot(1).unwrap().nodes;
            let mut original = planet_snapshot().nodes;
            exported.sort_by_key(|n| n.id);
            original.sort_by_key(|n| n.id);
            assert_eq!(exported, original);
        }
    }

    describe "apply" {
        it "sets attributes" {
            tree.apply(Delta::set(10, "mood", "sleeping")).unwrap();
            assert_eq!(tree.node(10).unwrap().get_str("mood"), Some("sleeping"));
        }

        it "appends nodes carried by the delta" {
            let delta = Delta::append(2, "components", StateValue::Node(20)).with_nodes(vec![
                NodeSnapshot::new(20, NodeKind::Component).attr("name", "porter"),
            ]);
            tree.apply(delta).unwrap();
            assert_eq!(tree.node(20).unwrap().parent(), Some(2));
            assert_eq!(tree.query(1, "atmosphere/components/porter").unwrap().id(), 20);
        }

        it "rejects references to unknown nodes" {
            let err = tree.apply(Delta::append(2, "components", StateValue::Node(99))).unwrap_err();
            assert_eq!(err, StateError::DanglingReference(99));
            assert!(tree.node(2).unwrap().list("components").is_empty());
        }

        it "rejects kind mismatches and leaves the node untouched" {
            let err = tree.apply(Delta::append(10, "mood", "happy")).unwrap_err();
            assert!(matches!(err, StateError::KindMismatch { .. }));
            assert_eq!(tree.node(10).unwrap().get_str("mood"), Some("happy"));
        }

        it "fails for unknown nodes" {
            assert_eq!(
                tree.apply(Delta::set(404, "mood", "happy")).unwrap_err(),
                StateError::UnknownNode(404)
            );
        }

        it "ignores removal of absent items" {
            tree.apply(Delta::remove(3, "components", StateValue::Node(77))).unwrap();
            tree.apply(Delta::del_item(1, "messages", "nothing")).unwrap();
            assert_eq!(tree.node(3).unwrap().list("components").len(), 1);
        }

        it "destroys removed subtrees" {
            tree.apply(Delta::remove(3, "components", StateValue::Node(10))).unwrap();
            assert!(!tree.contains(10));
        }

        it "destroys a replaced child" {
            let delta = Delta::set(1, "atmosphere", StateValue::Node(30))
                .with_nodes(vec![NodeSnapshot::new(30, NodeKind::Atmosphere)]);
            tree.apply(delta).unwrap();
            assert!(!tree.contains(2));
            assert!(tree.contains(30));
        }
    }

    describe "listeners" {
        it "notifies in registration order" {
            let events = Arc::new(Mutex::new(Vec::new()));
            let first: Arc<dyn StateListener> = Arc::new(Recorder { tag: "a", events: events.clone() });
            let second: Arc<dyn StateListener> = Arc::new(Recorder { tag: "b", events: events.clone() });
            tree.add_listener(10, first).unwrap();
            tree.add_listener(10, second).unwrap();

            tree.apply(Delta::set(10, "mood", "sad")).unwrap();

            assert_eq!(
                *events.lock(),
                vec!["a:set mood Some(\"sad\")", "b:set mood Some(\"sad\")"]
            );
        }

        it "treats add and remove as idempotent" {
            let events = Arc::new(Mutex::new(Vec::new()));
            let listener: Arc<dyn StateListener> = Arc::new(Recorder { tag: "a", events: events.clone() });
            tree.add_listener(10, listener.clone()).unwrap();
            tree.add_listener(10, listener.clone()).unwrap();
            assert_eq!(tree.node(10).unwrap().listener_count(), 1);

            assert!(tree.remove_listener(10, &listener));
            assert!(!tree.remove_listener(10, &listener));
            assert!(!tree.remove_listener(404, &listener));
        }

        it "lets the parent read a removed child, then destroys it" {
            let events = Arc::new(Mutex::new(Vec::new()));
            let flow: Arc<dyn StateListener> = Arc::new(Recorder { tag: "flow", events: events.clone() });
            let component: Arc<dyn StateListener> = Arc::new(Recorder { tag: "comp", events: events.clone() });
            tree.add_listener(3, flow).unwrap();
            tree.add_listener(10, component).unwrap();

            tree.apply(Delta::remove(3, "components", StateValue::Node(10))).unwrap();

            assert_eq!(
                *events.lock(),
                vec!["flow:remove components readable=true", "comp:destroyed 10"]
            );
        }

        it "tells everyone on clear" {
            let events = Arc::new(Mutex::new(Vec::new()));
            let listener: Arc<dyn StateListener> = Arc::new(Recorder { tag: "a", events: events.clone() });
            tree.add_listener(10, listener).unwrap();

            tree.clear();

            assert!(tree.is_empty());
            assert_eq!(*events.lock(), vec!["a:destroyed 10"]);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn replay_matches_reference_model(changes in proptest::collection::vec(change_strategy(), 0..200)) {
        let mut tree = StateTree::new();
        tree.load(Snapshot::new(1, vec![NodeSnapshot::new(1, NodeKind::Other)]))
            .unwrap();
        let mut reference = ReferenceNode::default();

        for change in changes {
            reference.replay(&change);
            tree.apply(Delta::new(1, change)).unwrap();
        }

        prop_assert_eq!(ReferenceNode::observe(&tree, 1), reference);
    }
}
