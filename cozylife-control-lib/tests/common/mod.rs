#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cozylife_control_lib::config::DeviceConfig;
use cozylife_control_lib::util::catalog::{parse_catalog, Catalog};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const MOCK_DID: &str = "mock_device_123";
pub const MOCK_PID: &str = "p93sfg";

pub const CATALOG_BODY: &str = r#"{"ret":"1","info":{"list":[
    {"device_type_code":"00","device_model":[
        {"device_product_id":"e2s64v","icon":"https://example.com/switch.png","device_model_name":"Wall Switch","dpid":[1]}]},
    {"device_type_code":"01","device_model":[
        {"device_product_id":"p93sfg","icon":"https://example.com/icon.png","device_model_name":"Smart Bulb Light","dpid":[1,2,3,4,5,6]}]}
]}}"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn offline_catalog() -> Arc<Catalog> {
    Arc::new(Catalog::preloaded(Vec::new()))
}

pub fn loaded_catalog() -> Arc<Catalog> {
    Arc::new(Catalog::preloaded(parse_catalog(CATALOG_BODY).unwrap()))
}

pub fn link_config(port: u16) -> DeviceConfig {
    DeviceConfig::new("127.0.0.1")
        .with_port(port)
        .with_timeout(Duration::from_millis(500))
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// How the mock deviates from a well-behaved device.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Push a `cmd:10` status report after every SET response.
    pub push_status_after_set: bool,
    /// Send a frame with a foreign serial number before every response.
    pub stale_frame_before_response: bool,
    /// Answer SET with `res: 1`.
    pub reject_sets: bool,
    /// Read requests but never answer.
    pub silent: bool,
    /// Leave QUERY requests unanswered, answer everything else.
    pub ignore_queries: bool,
    /// Replace the `msg` of INFO responses.
    pub info_message: Option<Value>,
}

struct Shared {
    state: Mutex<BTreeMap<String, u64>>,
    requests: Mutex<Vec<Value>>,
    responses: Mutex<Vec<Value>>,
    behavior: Mutex<MockBehavior>,
    connections: AtomicUsize,
}

/// In-process CozyLife device speaking the line protocol on a random local port.
pub struct MockDevice {
    pub port: u16,
    shared: Arc<Shared>,
    kick: watch::Sender<u64>,
    server: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = [("1", 0), ("2", 0), ("3", 500), ("4", 500), ("5", 0), ("6", 0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            behavior: Mutex::new(MockBehavior::default()),
            connections: AtomicUsize::new(0),
        });
        let (kick, _) = watch::channel(0u64);

        let server = {
            let shared = shared.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(handle_client(stream, shared.clone(), kick.subscribe()));
                }
            })
        };

        MockDevice {
            port,
            shared,
            kick,
            server,
        }
    }

    pub fn config(&self) -> DeviceConfig {
        link_config(self.port)
    }

    pub fn state(&self, register: &str) -> Option<u64> {
        self.shared.state.lock().unwrap().get(register).copied()
    }

    pub fn registers(&self) -> BTreeMap<String, u64> {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, register: &str, value: u64) {
        self.shared
            .state
            .lock()
            .unwrap()
            .insert(register.to_string(), value);
    }

    pub fn set_behavior(&self, update: impl FnOnce(&mut MockBehavior)) {
        update(&mut self.shared.behavior.lock().unwrap());
    }

    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn requests_with_cmd(&self, cmd: u64) -> usize {
        self.requests()
            .iter()
            .filter(|request| request["cmd"] == cmd)
            .count()
    }

    pub fn responses(&self) -> Vec<Value> {
        self.shared.responses.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Closes every open client connection from the device side.
    pub fn kick_clients(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Stops accepting connections and closes the open ones.
    pub fn stop(&self) {
        self.server.abort();
        self.kick_clients();
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_client(stream: TcpStream, shared: Arc<Shared>, mut kick: watch::Receiver<u64>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = kick.changed() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(line.trim()) else { break };
                shared.requests.lock().unwrap().push(request.clone());

                let behavior = shared.behavior.lock().unwrap().clone();
                if behavior.silent || (behavior.ignore_queries && request["cmd"] == 2) {
                    continue;
                }
                let mut frames = Vec::new();
                if behavior.stale_frame_before_response {
                    frames.push(json!({"cmd":2,"pv":0,"sn":"1","msg":{"attr":[1],"data":{"1":255}},"res":0}));
                }
                frames.push(process_request(&shared, &request, &behavior));
                if request["cmd"] == 3 && behavior.push_status_after_set {
                    let state = shared.state.lock().unwrap().clone();
                    frames.push(json!({"cmd":10,"pv":0,"sn":"99","res":0,"msg":{"attr":[1,2,3,4,5,6],"data":state}}));
                }
                for frame in frames {
                    shared.responses.lock().unwrap().push(frame.clone());
                    let line = format!("{}\r\n", frame);
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn process_request(shared: &Shared, request: &Value, behavior: &MockBehavior) -> Value {
    let sn = request["sn"].clone();
    match request["cmd"].as_u64() {
        Some(0) if behavior.info_message.is_some() => {
            json!({"cmd":0,"pv":0,"sn":sn,"msg":behavior.info_message,"res":0})
        }
        Some(0) => json!({"cmd":0,"pv":0,"sn":sn,"msg":{
            "did":MOCK_DID,"pid":MOCK_PID,"dtp":"02","mac":"mockmac123","ip":"127.0.0.1",
            "rssi":-30,"sv":"1.0.0","hv":"0.0.1"},"res":0}),
        Some(2) => {
            let state = shared.state.lock().unwrap().clone();
            json!({"cmd":2,"pv":0,"sn":sn,"msg":{"attr":[1,2,3,4,5,6],"data":state},"res":0})
        }
        Some(3) => {
            let data = request["msg"]["data"].clone();
            if behavior.reject_sets {
                return json!({"cmd":3,"pv":0,"sn":sn,"res":1});
            }
            let mut attr = Vec::new();
            if let Some(data) = data.as_object() {
                let mut state = shared.state.lock().unwrap();
                for (register, value) in data {
                    if let Some(value) = value.as_u64() {
                        state.insert(register.clone(), value);
                    }
                    attr.push(register.parse::<u64>().unwrap_or_default());
                }
            }
            json!({"cmd":3,"pv":0,"sn":sn,"msg":{"attr":attr,"data":data},"res":0})
        }
        _ => json!({"cmd":request["cmd"],"pv":0,"sn":sn,"res":1}),
    }
}

/// Minimal HTTP server answering every request with one JSON body.
pub struct CatalogStub {
    pub url: String,
    hits: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<String>>>,
    server: JoinHandle<()>,
}

impl CatalogStub {
    pub async fn start(body: &str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!(
            "http://{}/api/device_product/model",
            listener.local_addr().unwrap()
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(Mutex::new(None));
        let body = body.to_string();

        let server = {
            let hits = hits.clone();
            let last_request = last_request.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = body.clone();
                    let last_request = last_request.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match stream.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let head = String::from_utf8_lossy(&request).to_string();
                        *last_request.lock().unwrap() = head.lines().next().map(str::to_string);
                        sleep(delay).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
            })
        };

        CatalogStub {
            url,
            hits,
            last_request,
            server,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Request line of the last request, e.g. `GET /api/device_product/model?lang=en HTTP/1.1`.
    pub fn last_request(&self) -> Option<String> {
        self.last_request.lock().unwrap().clone()
    }
}

impl Drop for CatalogStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}
