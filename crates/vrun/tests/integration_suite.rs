//! End-to-end tests for the vrun adapter, driven through JSON strings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use serde_json::json;

use vrun::Adapter;
use vrun::Callback;
use vrun::ClassBuilder;
use vrun::ClassDescriptor;
use vrun::Reply;

/// Entries grouped by category, plus listeners told about each new entry.
#[derive(Default)]
struct TestClass {
    entries: Mutex<BTreeMap<String, Vec<Value>>>,
    listeners: Mutex<Vec<Callback>>,
}

impl TestClass {
    fn add_entry(&self, category: String, entry: Value) {
        self.entries
            .lock()
            .unwrap()
            .entry(category)
            .or_default()
            .push(entry.clone());
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let _ = listener.call([entry.clone()]);
        }
    }
}

fn test_class() -> ClassDescriptor {
    ClassBuilder::<TestClass>::new("TestClass")
        .constructor(|args| {
            let entries = args.opt_as::<BTreeMap<String, Vec<Value>>>(0)?.unwrap_or_default();
            Ok(TestClass {
                entries: Mutex::new(entries),
                ..Default::default()
            })
        })
        .method("addEntry", |t, args| {
            t.add_entry(args.get_as(0)?, args.value(1)?.clone());
            Ok(Reply::unit())
        })
        .method("removeEntry", |t, args| {
            let category: String = args.get_as(0)?;
            let mut entries = t.entries.lock().unwrap();
            let list = entries
                .get_mut(&category)
                .ok_or_else(|| anyhow!("Can not remove entry of unknown category: {}", category))?;
            let removed = list.pop();
            if list.is_empty() {
                entries.remove(&category);
            }
            Reply::value(removed)
        })
        .method("getEntries", |t, args| {
            let category: String = args.get_as(0)?;
            Reply::value(t.entries.lock().unwrap().get(&category).cloned().unwrap_or_default())
        })
        .method("hasCategory", |t, args| {
            let category: String = args.get_as(0)?;
            Reply::value(t.entries.lock().unwrap().contains_key(&category))
        })
        .method("notifyOnNew", |t, args| {
            t.listeners.lock().unwrap().push(args.callback(0)?);
            Ok(Reply::unit())
        })
        .method("callMeBack", |_, args| {
            args.callback(0)?.call([json!(100)])?;
            Ok(Reply::unit())
        })
        .method("callMeBackLater", |_, args| {
            let callback = args.callback(0)?;
            Ok(Reply::future(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                callback.call([json!(100)])?;
                Ok::<_, anyhow::Error>(Value::Null)
            }))
        })
        .method("waitForMe", |_, args| {
            let value: u64 = args.get_as(0)?;
            Ok(Reply::future(async move {
                if value > 0 {
                    tokio::time::sleep(Duration::from_millis(value.min(200))).await;
                }
                Ok(value)
            }))
        })
        .static_fn("crazy", |args| match args.opt_as::<String>(0)? {
            Some(who) => Reply::value(format!("{who} is crazy!")),
            None => Reply::value("who is crazy?"),
        })
        .build()
        .expect("TestClass is a valid class")
}

fn request(target: &str, method: &str, data: Value) -> String {
    json!({ "targetId": target, "method": method, "data": data }).to_string()
}

/// Sends one request and parses the JSON response.
fn call(adapter: &Adapter, target: &str, method: &str, data: Value) -> Value {
    let text = adapter.call(&request(target, method, data)).expect("structurally valid request");
    serde_json::from_str(&text).expect("response is valid JSON")
}

// --- Async fixture: ambient tokio runtime ---

struct Harness {
    adapter: Adapter,
    emissions: tokio::sync::mpsc::UnboundedReceiver<Value>,
}

impl Harness {
    fn new() -> Self {
        vrun::logging::init();
        let adapter = Adapter::new().expect("Failed to create adapter");
        adapter.register(test_class());
        let (tx, emissions) = tokio::sync::mpsc::unbounded_channel();
        adapter.on_callback(move |json| {
            let _ = tx.send(serde_json::from_str(&json).expect("emission is valid JSON"));
        });
        Self { adapter, emissions }
    }

    fn create(&self) -> String {
        let ret = call(&self.adapter, "TestClass", "__create__", json!({}));
        ret["data"]["r"].as_str().expect("instance id").to_string()
    }

    async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.emissions.recv())
            .await
            .expect("timed out waiting for emission")
            .expect("emission channel closed")
    }
}

// --- Test 1: Instantiation (scenario A) ---

#[tokio::test]
async fn test_create_with_plain_json() {
    let h = Harness::new();
    let ret = call(&h.adapter, "TestClass", "__create__", json!({}));

    assert_eq!(ret["targetId"], "TestClass");
    assert_eq!(ret["method"], "__create__");
    let id = ret["data"]["r"].as_str().unwrap();
    assert!(!id.is_empty());
    assert!(ret["data"].get("e").is_none());
    assert_eq!(h.adapter.instances("TestClass"), vec![id.to_string()]);
}

#[tokio::test]
async fn test_create_without_data_uses_default_state() {
    let h = Harness::new();
    let text = h
        .adapter
        .call(r#"{"targetId":"TestClass","method":"__create__"}"#)
        .unwrap();
    let ret: Value = serde_json::from_str(&text).unwrap();
    let id = ret["data"]["r"].as_str().unwrap();
    let ret = call(&h.adapter, id, "hasCategory", json!({ "_1": "test" }));
    assert_eq!(ret["data"]["r"], false);
}

#[tokio::test]
async fn test_create_with_constructor_arguments() {
    let h = Harness::new();
    let ret = call(&h.adapter, "TestClass", "__create__", json!({ "_1": { "test": [1, 2] } }));
    let id = ret["data"]["r"].as_str().unwrap();

    let ret = call(&h.adapter, id, "getEntries", json!({ "_1": "test" }));
    assert_eq!(ret["data"]["r"], json!([1, 2]));
}

#[tokio::test]
async fn test_instances_are_distinct() {
    let h = Harness::new();
    let a = h.create();
    let b = h.create();
    assert_ne!(a, b);

    call(&h.adapter, &a, "addEntry", json!({ "_1": "only-a", "_2": 1 }));
    assert_eq!(call(&h.adapter, &a, "hasCategory", json!({ "_1": "only-a" }))["data"]["r"], true);
    assert_eq!(call(&h.adapter, &b, "hasCategory", json!({ "_1": "only-a" }))["data"]["r"], false);
}

// --- Test 2: Member calls (scenario B) ---

#[tokio::test]
async fn test_member_function_call() {
    let h = Harness::new();
    let id = h.create();

    let ret = call(&h.adapter, &id, "hasCategory", json!({ "_1": "test" }));
    assert_eq!(ret["data"]["r"], false);
    assert_eq!(ret["targetId"], id.as_str());
    assert_eq!(ret["method"], "hasCategory");

    call(&h.adapter, &id, "addEntry", json!({ "_1": "test", "_2": { "a": 1 } }));
    assert_eq!(call(&h.adapter, &id, "hasCategory", json!({ "_1": "test" }))["data"]["r"], true);

    let ret = call(&h.adapter, &id, "removeEntry", json!({ "_1": "test" }));
    assert_eq!(ret["data"]["r"], json!({ "a": 1 }));
    assert_eq!(call(&h.adapter, &id, "hasCategory", json!({ "_1": "test" }))["data"]["r"], false);
}

#[tokio::test]
async fn test_native_error_is_reported_in_data() {
    let h = Harness::new();
    let id = h.create();

    let ret = call(&h.adapter, &id, "removeEntry", json!({ "_1": "nope" }));
    assert_eq!(ret["data"]["e"], "Can not remove entry of unknown category: nope");
    assert!(ret["data"].get("r").is_none());
}

// --- Test 3: Unknown function and target (scenarios C, D) ---

#[tokio::test]
async fn test_unknown_function() {
    let h = Harness::new();
    let id = h.create();
    let ret = call(&h.adapter, &id, "not_there", json!({}));
    assert_eq!(ret["data"]["e"], "Could not find function: not_there");
}

#[tokio::test]
async fn test_unknown_target() {
    let h = Harness::new();
    let ret = call(&h.adapter, "wrong", "not_there", json!({}));
    assert_eq!(ret["data"]["e"], "Could not find targetId: wrong");

    let ret = call(&h.adapter, "Wrong", "__create__", json!({}));
    assert_eq!(ret["data"]["e"], "Could not find targetId: Wrong");
}

// --- Test 4: Promises (scenario E) ---

#[tokio::test]
async fn test_promise_resolves_once() {
    let mut h = Harness::new();
    let id = h.create();

    let ret = call(&h.adapter, &id, "waitForMe", json!({ "_1": 101 }));
    let promise = ret["data"]["r"].as_str().unwrap().to_string();
    assert!(promise.starts_with("__p__"));

    let emission = h.next().await;
    assert_eq!(emission["id"], promise.as_str());
    assert_eq!(emission["data"]["r"], 101);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.emissions.try_recv().is_err(), "promise must resolve exactly once");
    assert_eq!(h.adapter.pending_promises(), 0);
}

#[tokio::test]
async fn test_concurrent_promises_are_distinguishable() {
    let mut h = Harness::new();
    let id = h.create();

    let slow = call(&h.adapter, &id, "waitForMe", json!({ "_1": 60 }))["data"]["r"].clone();
    let fast = call(&h.adapter, &id, "waitForMe", json!({ "_1": 5 }))["data"]["r"].clone();
    assert_ne!(slow, fast);

    let first = h.next().await;
    let second = h.next().await;
    assert_eq!(first["id"], fast);
    assert_eq!(first["data"]["r"], 5);
    assert_eq!(second["id"], slow);
    assert_eq!(second["data"]["r"], 60);
}

#[tokio::test]
async fn test_promise_survives_instance_deletion() {
    let mut h = Harness::new();
    let id = h.create();

    let promise = call(&h.adapter, &id, "waitForMe", json!({ "_1": 20 }))["data"]["r"].clone();
    call(&h.adapter, &id, "__delete__", json!({}));

    let emission = h.next().await;
    assert_eq!(emission["id"], promise);
    assert_eq!(emission["data"]["r"], 20);
}

// --- Test 5: Callbacks ---

#[tokio::test]
async fn test_callback_fires_before_promise_resolves() {
    let mut h = Harness::new();
    let id = h.create();

    let ret = call(&h.adapter, &id, "callMeBackLater", json!({ "_1": "__f__callback-1" }));
    let promise = ret["data"]["r"].as_str().unwrap().to_string();

    let first = h.next().await;
    assert_eq!(first["id"], "__f__callback-1");
    assert_eq!(first["data"]["_1"], 100);

    let second = h.next().await;
    assert_eq!(second["id"], promise.as_str());
    assert_eq!(second["data"]["r"], Value::Null);
}

#[tokio::test]
async fn test_callback_fires_synchronously() {
    let mut h = Harness::new();
    let id = h.create();

    let ret = call(&h.adapter, &id, "callMeBack", json!({ "_1": "__f__now" }));
    assert_eq!(ret["data"]["r"], Value::Null);

    // Already delivered by the time the response came back.
    let emission = h.emissions.try_recv().expect("emitted during the call");
    assert_eq!(emission["id"], "__f__now");
    assert_eq!(emission["data"]["_1"], 100);
}

#[tokio::test]
async fn test_callback_fires_repeatedly_until_deleted() {
    let mut h = Harness::new();
    let id = h.create();

    call(&h.adapter, &id, "notifyOnNew", json!({ "_1": "__f__onNew" }));
    for i in 0..3 {
        call(&h.adapter, &id, "addEntry", json!({ "_1": "cat", "_2": i }));
    }
    for i in 0..3 {
        let emission = h.next().await;
        assert_eq!(emission["id"], "__f__onNew");
        assert_eq!(emission["data"]["_1"], i);
    }
    assert_eq!(h.adapter.live_callbacks(), 1);

    let ret = call(&h.adapter, &id, "__delete__", json!({}));
    assert_eq!(ret["data"]["r"], true);
    assert_eq!(h.adapter.live_callbacks(), 0);
}

#[tokio::test]
async fn test_callback_without_handler_is_dropped() {
    let adapter = Adapter::new().unwrap();
    adapter.register(test_class());
    let ret = call(&adapter, "TestClass", "__create__", json!({}));
    let id = ret["data"]["r"].as_str().unwrap();

    let ret = call(&adapter, id, "callMeBack", json!({ "_1": "__f__nobody" }));
    assert_eq!(ret["data"]["r"], Value::Null);
}

#[tokio::test]
async fn test_handler_replacement() {
    let mut h = Harness::new();
    let id = h.create();

    let (tx, mut replacement) = tokio::sync::mpsc::unbounded_channel::<String>();
    h.adapter.on_callback(move |json| {
        let _ = tx.send(json);
    });

    call(&h.adapter, &id, "callMeBack", json!({ "_1": "__f__x" }));
    assert!(h.emissions.try_recv().is_err());
    let json = replacement.try_recv().unwrap();
    assert_eq!(serde_json::from_str::<Value>(&json).unwrap()["id"], "__f__x");
}

// --- Test 6: Static functions and deletion ---

#[tokio::test]
async fn test_static_function() {
    let h = Harness::new();
    let ret = call(&h.adapter, "TestClass", "crazy", json!({}));
    assert_eq!(ret["data"]["r"], "who is crazy?");

    let ret = call(&h.adapter, "TestClass", "crazy", json!({ "_1": "vrpc" }));
    assert_eq!(ret["data"]["r"], "vrpc is crazy!");

    let ret = call(&h.adapter, "TestClass", "hasCategory", json!({ "_1": "x" }));
    assert_eq!(ret["data"]["e"], "Could not find function: hasCategory");
}

#[tokio::test]
async fn test_delete_then_call() {
    let h = Harness::new();
    let id = h.create();

    assert_eq!(call(&h.adapter, &id, "__delete__", json!({}))["data"]["r"], true);
    let expected = format!("Could not find targetId: {}", id);
    assert_eq!(call(&h.adapter, &id, "hasCategory", json!({ "_1": "x" }))["data"]["e"], expected.as_str());
    assert_eq!(call(&h.adapter, &id, "__delete__", json!({}))["data"]["e"], expected.as_str());
}

#[tokio::test]
async fn test_introspection() {
    let h = Harness::new();
    let id = h.create();

    assert_eq!(h.adapter.classes(), vec!["TestClass".to_string()]);
    assert_eq!(h.adapter.instances("TestClass"), vec![id]);
    assert_eq!(h.adapter.static_functions("TestClass").unwrap(), vec!["crazy".to_string()]);
    assert_eq!(
        h.adapter.member_functions("TestClass").unwrap(),
        vec![
            "addEntry",
            "callMeBack",
            "callMeBackLater",
            "getEntries",
            "hasCategory",
            "notifyOnNew",
            "removeEntry",
            "waitForMe",
        ]
    );
    assert_eq!(
        h.adapter.member_functions("Nope").unwrap_err().to_string(),
        "Could not find targetId: Nope"
    );
}

// --- Test 7: Structural errors ---

#[tokio::test]
async fn test_structural_errors_from_argument_list() {
    let h = Harness::new();

    let err = h.adapter.call_args(&[]).unwrap_err();
    assert_eq!(err.to_string(), "Wrong number of arguments, expecting exactly one");

    let err = h.adapter.call_args(&[json!("a"), json!("b")]).unwrap_err();
    assert_eq!(err.to_string(), "Wrong number of arguments, expecting exactly one");

    let err = h.adapter.call_args(&[json!(15)]).unwrap_err();
    assert_eq!(err.to_string(), "Wrong argument type, expecting string");

    let err = h.adapter.call_args(&[json!("")]).unwrap_err();
    assert_eq!(err.to_string(), "Failed converting argument to valid and non-empty string");

    let ok = h
        .adapter
        .call_args(&[json!(request("TestClass", "crazy", json!({})))])
        .unwrap();
    assert!(ok.contains("who is crazy?"));
}

#[tokio::test]
async fn test_structural_errors_from_string() {
    let h = Harness::new();

    let err = h.adapter.call("bad;").unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("parse error"), "{}", message);
    assert!(message.contains("line 1"), "{}", message);

    let err = h.adapter.call("   ").unwrap_err();
    assert_eq!(err.to_string(), "Failed converting argument to valid and non-empty string");

    assert!(h.adapter.call("[1, 2]").is_err());
    assert!(h.adapter.call(r#"{"method":"crazy"}"#).is_err());
}

// --- Test 8: Owned runtime and concurrent callers ---

#[test]
fn test_owned_runtime_without_ambient_tokio() {
    let adapter = Adapter::builder()
        .worker_threads(1)
        .thread_name("vrun-test")
        .build()
        .expect("adapter with owned runtime");
    adapter.register(test_class());
    let (tx, rx) = std::sync::mpsc::channel::<Value>();
    adapter.on_callback(move |json| {
        let _ = tx.send(serde_json::from_str(&json).unwrap());
    });

    let id = call(&adapter, "TestClass", "__create__", json!({}))["data"]["r"]
        .as_str()
        .unwrap()
        .to_string();
    let promise = call(&adapter, &id, "waitForMe", json!({ "_1": 101 }))["data"]["r"].clone();

    let emission = rx.recv_timeout(Duration::from_secs(2)).expect("promise completion");
    assert_eq!(emission["id"], promise);
    assert_eq!(emission["data"]["r"], 101);
}

#[test]
fn test_builder_preinstalled_handler() {
    let (tx, rx) = std::sync::mpsc::channel::<String>();
    let adapter = Adapter::builder()
        .on_callback(move |json| {
            let _ = tx.send(json);
        })
        .build()
        .unwrap();
    adapter.register(test_class());

    let id = adapter.create("TestClass", vec![]).unwrap();
    call(&adapter, &id, "callMeBack", json!({ "_1": "__f__pre" }));
    let emission: Value = serde_json::from_str(&rx.recv_timeout(Duration::from_secs(1)).unwrap()).unwrap();
    assert_eq!(emission["id"], "__f__pre");
}

#[test]
fn test_concurrent_callers() {
    let adapter = Arc::new(Adapter::builder().worker_threads(2).build().unwrap());
    adapter.register(test_class());
    let (tx, rx) = std::sync::mpsc::channel::<Value>();
    adapter.on_callback(move |json| {
        let _ = tx.send(serde_json::from_str(&json).unwrap());
    });

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let adapter = Arc::clone(&adapter);
            std::thread::spawn(move || {
                let id = adapter.create("TestClass", vec![]).unwrap();
                for i in 0..25 {
                    let ret = call(&adapter, &id, "addEntry", json!({ "_1": format!("t{t}"), "_2": i }));
                    assert!(ret["data"].get("e").is_none());
                }
                let promise = call(&adapter, &id, "waitForMe", json!({ "_1": t }))["data"]["r"].clone();
                let entries = call(&adapter, &id, "getEntries", json!({ "_1": format!("t{t}") }));
                assert_eq!(entries["data"]["r"].as_array().unwrap().len(), 25);
                promise
            })
        })
        .collect();

    let mut promises: Vec<Value> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    promises.sort_by_key(|p| p.as_str().unwrap().to_string());
    promises.dedup();
    assert_eq!(promises.len(), 8);
    assert_eq!(adapter.instances("TestClass").len(), 8);

    let mut resolved = Vec::new();
    for _ in 0..8 {
        let emission = rx.recv_timeout(Duration::from_secs(2)).expect("completion");
        resolved.push(emission["id"].clone());
    }
    resolved.sort_by_key(|p| p.as_str().unwrap().to_string());
    assert_eq!(resolved, promises);
}

#[test]
fn test_promise_never_emitted_before_call_returns() {
    let adapter = Adapter::builder().worker_threads(2).build().unwrap();
    adapter.register(test_class());

    let in_call = Arc::new(AtomicBool::new(false));
    let early = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel::<String>();
    {
        let in_call = Arc::clone(&in_call);
        let early = Arc::clone(&early);
        adapter.on_callback(move |json| {
            if in_call.load(Ordering::SeqCst) {
                early.fetch_add(1, Ordering::SeqCst);
            }
            let _ = tx.send(json);
        });
    }

    let id = adapter.create("TestClass", vec![]).unwrap();
    let text = request(&id, "waitForMe", json!({ "_1": 0 }));
    for _ in 0..200 {
        in_call.store(true, Ordering::SeqCst);
        let response = adapter.call(&text).unwrap();
        in_call.store(false, Ordering::SeqCst);

        let promise = serde_json::from_str::<Value>(&response).unwrap()["data"]["r"].clone();
        let emission: Value = serde_json::from_str(&rx.recv_timeout(Duration::from_secs(2)).unwrap()).unwrap();
        assert_eq!(emission["id"], promise);
    }
    assert_eq!(early.load(Ordering::SeqCst), 0);
}
