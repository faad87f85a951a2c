use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use crate::config::DeviceConfig;
use crate::util::catalog::{Catalog, ProductMetadata};
use crate::util::frame::{
    Command, DeviceInfo, FrameCodec, RegisterMap, RequestFrame, ResponseFrame,
};
use crate::util::sn::next_sn;
use crate::util::traits::ResponseCodeTrait;

/// Frames read while waiting for the response to one request.
pub const RESPONSE_ATTEMPTS: usize = 10;

type Transport = Framed<TcpStream, FrameCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What is known about the device behind a link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub device_id: Option<String>,
    pub product_id: Option<String>,
    pub metadata: ProductMetadata,
}

enum ReadOutcome {
    Line(String),
    TimedOut,
    Closed,
}

/// A persistent TCP session with one CozyLife device.
///
/// The link reconnects on its own: a failed write is retried once on a fresh
/// connection, and a heartbeat task started by [`DeviceLink::connect`] pings the device
/// every [`DeviceConfig::heartbeat_interval`] and reopens dead connections. At most one
/// heartbeat task runs per link; [`DeviceLink::disconnect`] cancels it and waits for it.
///
/// Operations never return errors. Failures are logged and reported as `None`/`false`,
/// and [`DeviceLink::available`] tells whether the socket is currently open.
///
/// Operations on one link are serialized by the socket lock, but a read-modify-write
/// spanning a query and a control needs the coordinator's device lock on top.
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: DeviceConfig,
    catalog: Arc<Catalog>,
    transport: Mutex<Option<Transport>>,
    state: StdMutex<ConnectionState>,
    identity: RwLock<Identity>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl DeviceLink {
    /// Creates a disconnected link resolving product metadata through the global catalog.
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_catalog(config, Catalog::global())
    }

    pub fn with_catalog(config: DeviceConfig, catalog: Arc<Catalog>) -> Self {
        let identity = Identity {
            device_id: config.device_id.clone(),
            product_id: config.product_id.clone(),
            metadata: ProductMetadata {
                device_model_name: config.model_name.clone(),
                dpid: config.dpid.clone(),
                ..ProductMetadata::default()
            },
        };
        DeviceLink {
            inner: Arc::new(LinkInner {
                config,
                catalog,
                transport: Mutex::new(None),
                state: StdMutex::new(ConnectionState::Disconnected),
                identity: RwLock::new(identity),
                heartbeat: StdMutex::new(None),
            }),
        }
    }

    /// Opens the connection and starts the heartbeat. Returns whether the device was reached;
    /// on failure the link stays disconnected. An open connection is kept as it is.
    pub async fn connect(&self) -> bool {
        self.inner.connect().await
    }

    /// Stops the heartbeat and closes the socket. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        // A heartbeat caught between two await points may still spawn its successor.
        loop {
            let task = lock(&self.inner.heartbeat).take();
            match task {
                Some(task) => {
                    task.abort();
                    let _ = task.await;
                }
                None => break,
            }
        }
        let mut transport = self.inner.transport.lock().await;
        self.inner.close_locked(&mut transport);
    }

    /// Whether the socket is open. Does no I/O.
    pub fn available(&self) -> bool {
        self.inner.available()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn heartbeat_running(&self) -> bool {
        lock(&self.inner.heartbeat)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Asks the device who it is and records its device id and product id, then resolves
    /// the product metadata through the catalog.
    ///
    /// Fields are validated in order (`did`, then `pid`) and each is recorded as soon as it
    /// is validated. Returns the full identity payload when the response was well-formed.
    pub async fn fetch_identity(&self) -> Option<DeviceInfo> {
        let endpoint = self.inner.endpoint();
        let line = self
            .inner
            .send_and_read_one(RequestFrame::info(next_sn()))
            .await?;

        let info = match ResponseFrame::parse(&line).and_then(|frame| frame.device_info()) {
            Ok(info) => info,
            Err(e) => {
                info!("{}: INFO response rejected: {:#}", endpoint, e);
                return None;
            }
        };
        let Some(device_id) = info.did.clone() else {
            info!("{}: INFO response has no did", endpoint);
            return None;
        };
        self.inner
            .update_identity(|identity| identity.device_id = Some(device_id.clone()));
        let Some(product_id) = info.pid.clone() else {
            info!("{}: INFO response has no pid", endpoint);
            return None;
        };
        self.inner
            .update_identity(|identity| identity.product_id = Some(product_id.clone()));

        match self.inner.catalog.lookup(&product_id).await {
            Some(metadata) => self
                .inner
                .update_identity(|identity| identity.metadata = metadata),
            None => debug!("{}: product {} is not in the catalog", endpoint, product_id),
        }

        let identity = self.identity();
        info!(
            "{}: device {} pid={} type={:?} model={:?} icon={:?}",
            endpoint,
            device_id,
            product_id,
            identity.metadata.device_type_code,
            identity.metadata.device_model_name,
            identity.metadata.icon
        );
        Some(info)
    }

    /// Reads every register. `None` when the device could not be reached, did not answer
    /// in time, or answered with something that is not a register map.
    pub async fn query(&self) -> Option<RegisterMap> {
        let response = self.inner.exchange(RequestFrame::query(next_sn())).await?;
        match response.data() {
            Ok(registers) => Some(registers),
            Err(e) => {
                info!("{}: QUERY response rejected: {:#}", self.inner.endpoint(), e);
                None
            }
        }
    }

    /// Writes registers. `true` only when the device acknowledged the write with `res == 0`.
    pub async fn control(&self, registers: &RegisterMap) -> bool {
        let frame = match RequestFrame::set(next_sn(), registers) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot encode SET: {:#}", self.inner.endpoint(), e);
                return false;
            }
        };
        match self.inner.exchange(frame).await {
            Some(response) => {
                let code = response.response_code();
                if code.is_error() {
                    info!(
                        "{}: SET rejected with res={:?} ({})",
                        self.inner.endpoint(),
                        response.res,
                        code.message
                    );
                }
                code.is_ok()
            }
            None => false,
        }
    }

    /// Sends a command without waiting for any answer. A link whose retry also failed is
    /// left disconnected.
    pub async fn send_only(&self, command: Command, registers: &RegisterMap) -> bool {
        match RequestFrame::new(command, next_sn(), registers) {
            Ok(frame) => self.inner.send_only(frame).await,
            Err(e) => {
                warn!("{}: cannot encode {}: {:#}", self.inner.endpoint(), command, e);
                false
            }
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    pub fn identity(&self) -> Identity {
        self.inner
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.identity().device_id
    }

    pub fn product_id(&self) -> Option<String> {
        self.identity().product_id
    }

    pub fn device_type_code(&self) -> Option<String> {
        self.identity().metadata.device_type_code
    }

    pub fn icon(&self) -> Option<String> {
        self.identity().metadata.icon
    }

    pub fn device_model_name(&self) -> Option<String> {
        self.identity().metadata.device_model_name
    }

    pub fn dpid(&self) -> Vec<u32> {
        self.identity().metadata.dpid
    }

    /// Key identifying the physical device: its device id once known, its address before.
    pub fn device_key(&self) -> String {
        self.device_id()
            .unwrap_or_else(|| self.inner.config.address.clone())
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.heartbeat).take() {
            task.abort();
        }
    }
}

impl LinkInner {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.address, self.config.port)
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn available(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn update_identity(&self, update: impl FnOnce(&mut Identity)) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut *identity);
    }

    async fn dial(&self) -> anyhow::Result<Transport> {
        let address = (self.config.address.as_str(), self.config.port);
        let stream = timeout(self.config.timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| anyhow!("connect timed out after {:?}", self.config.timeout()))?
            .context("connect failed")?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: cannot set TCP_NODELAY: {}", self.endpoint(), e);
        }
        Ok(Framed::new(stream, FrameCodec::new()))
    }

    async fn connect(self: &Arc<Self>) -> bool {
        let mut transport = self.transport.lock().await;
        if transport.is_some() && self.available() {
            debug!("{}: already connected", self.endpoint());
            return true;
        }
        self.open_locked(&mut transport).await
    }

    async fn open(self: &Arc<Self>) -> bool {
        let mut transport = self.transport.lock().await;
        self.open_locked(&mut transport).await
    }

    async fn open_locked(self: &Arc<Self>, slot: &mut Option<Transport>) -> bool {
        *slot = None;
        self.set_state(ConnectionState::Connecting);
        match self.dial().await {
            Ok(transport) => {
                *slot = Some(transport);
                self.set_state(ConnectionState::Connected);
                debug!("{}: connected", self.endpoint());
                self.start_heartbeat();
                true
            }
            Err(e) => {
                info!("Connect error, address={}: {:#}", self.endpoint(), e);
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn close_locked(&self, slot: &mut Option<Transport>) {
        if slot.take().is_some() {
            debug!("{}: connection closed", self.endpoint());
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn ensure_connected_locked(self: &Arc<Self>, slot: &mut Option<Transport>) -> bool {
        if slot.is_some() && self.available() {
            return true;
        }
        info!("Ensuring connection for {}", self.endpoint());
        let connected = self.open_locked(slot).await;
        if connected {
            info!("Reconnected to {}", self.endpoint());
        } else {
            warn!("Failed to reconnect to {}", self.endpoint());
        }
        connected
    }

    async fn write_locked(
        &self,
        slot: &mut Option<Transport>,
        frame: RequestFrame,
    ) -> anyhow::Result<()> {
        let transport = slot.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        timeout(self.config.timeout(), transport.send(frame))
            .await
            .map_err(|_| anyhow!("write timed out"))?
    }

    /// Writes a frame, retrying once on a fresh connection if the first write fails.
    async fn send_with_retry_locked(
        self: &Arc<Self>,
        slot: &mut Option<Transport>,
        frame: RequestFrame,
    ) -> bool {
        if !self.ensure_connected_locked(slot).await {
            return false;
        }
        let description = frame.to_string();
        match self.write_locked(slot, frame.clone()).await {
            Ok(()) => return true,
            Err(e) => info!(
                "{}: writing {} failed ({:#}), reconnecting",
                self.endpoint(),
                description,
                e
            ),
        }
        self.close_locked(slot);
        if !self.open_locked(slot).await {
            return false;
        }
        match self.write_locked(slot, frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{}: giving up on {} after retry: {:#}",
                    self.endpoint(),
                    description,
                    e
                );
                false
            }
        }
    }

    async fn read_line_locked(&self, slot: &mut Option<Transport>) -> ReadOutcome {
        let Some(transport) = slot.as_mut() else {
            return ReadOutcome::Closed;
        };
        let result = timeout(self.config.timeout(), transport.next()).await;
        match result {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Some(Ok(line))) => ReadOutcome::Line(line),
            Ok(Some(Err(e))) => {
                warn!("{}: read error: {:#}", self.endpoint(), e);
                self.close_locked(slot);
                ReadOutcome::Closed
            }
            Ok(None) => {
                info!("{}: connection closed by device", self.endpoint());
                self.close_locked(slot);
                ReadOutcome::Closed
            }
        }
    }

    /// Reads frames until one carries `sn`. Frames from earlier exchanges and unsolicited
    /// status reports are discarded.
    async fn await_response_locked(
        &self,
        slot: &mut Option<Transport>,
        sn: &str,
    ) -> Option<ResponseFrame> {
        for attempt in 1..=RESPONSE_ATTEMPTS {
            match self.read_line_locked(slot).await {
                ReadOutcome::Closed => return None,
                ReadOutcome::TimedOut => debug!(
                    "{}: no frame for sn {} (attempt {}/{})",
                    self.endpoint(),
                    sn,
                    attempt,
                    RESPONSE_ATTEMPTS
                ),
                ReadOutcome::Line(line) => match ResponseFrame::parse(&line) {
                    Ok(frame) if frame.sn() == Some(sn) => return Some(frame),
                    Ok(frame) => debug!(
                        "{}: discarding frame cmd={:?} sn={:?} while waiting for sn {}",
                        self.endpoint(),
                        frame.cmd,
                        frame.sn,
                        sn
                    ),
                    Err(e) => debug!(
                        "{}: discarding unreadable frame {:?}: {:#}",
                        self.endpoint(),
                        line,
                        e
                    ),
                },
            }
        }
        warn!(
            "{}: no response for sn {} after {} attempts",
            self.endpoint(),
            sn,
            RESPONSE_ATTEMPTS
        );
        if self.config.resync_on_timeout {
            self.close_locked(slot);
        }
        None
    }

    async fn exchange(self: &Arc<Self>, frame: RequestFrame) -> Option<ResponseFrame> {
        let sn = frame.sn().to_string();
        let mut transport = self.transport.lock().await;
        if !self.send_with_retry_locked(&mut transport, frame).await {
            return None;
        }
        self.await_response_locked(&mut transport, &sn).await
    }

    async fn send_and_read_one(self: &Arc<Self>, frame: RequestFrame) -> Option<String> {
        let description = frame.to_string();
        let mut transport = self.transport.lock().await;
        if !self.send_with_retry_locked(&mut transport, frame).await {
            return None;
        }
        match self.read_line_locked(&mut transport).await {
            ReadOutcome::Line(line) => Some(line),
            ReadOutcome::TimedOut => {
                info!("{}: {} timed out", self.endpoint(), description);
                None
            }
            ReadOutcome::Closed => None,
        }
    }

    async fn send_only(self: &Arc<Self>, frame: RequestFrame) -> bool {
        let mut transport = self.transport.lock().await;
        if self.send_with_retry_locked(&mut transport, frame).await {
            return true;
        }
        self.close_locked(&mut transport);
        false
    }

    /// INFO round trip on an idle connection. Catches half-open sockets and drains the
    /// stray frame a device may have pushed since the last exchange.
    async fn ping(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut transport = self.transport.lock().await;
        if !self.ensure_connected_locked(&mut transport).await {
            bail!("not connected");
        }
        self.write_locked(&mut transport, RequestFrame::info(next_sn()))
            .await?;
        match self.read_line_locked(&mut transport).await {
            ReadOutcome::Line(_) => Ok(()),
            ReadOutcome::TimedOut => bail!("no answer within {:?}", self.config.timeout()),
            ReadOutcome::Closed => bail!("connection closed"),
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let mut heartbeat = lock(&self.heartbeat);
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let interval = self.config.heartbeat_interval();
        *heartbeat = Some(tokio::spawn(heartbeat_loop(Arc::downgrade(self), interval)));
    }
}

async fn heartbeat_loop(link: Weak<LinkInner>, interval: Duration) {
    loop {
        sleep(interval).await;
        let Some(link) = link.upgrade() else {
            break;
        };
        if !link.available() {
            info!(
                "Heartbeat: connection not available for {}, attempting reconnect",
                link.endpoint()
            );
            heartbeat_reconnect(&link).await;
            continue;
        }
        if let Err(e) = link.ping().await {
            info!(
                "Heartbeat: ping failed for {} ({:#}), attempting reconnect",
                link.endpoint(),
                e
            );
            heartbeat_reconnect(&link).await;
        }
    }
}

async fn heartbeat_reconnect(link: &Arc<LinkInner>) {
    if link.open().await {
        info!("Heartbeat: reconnected to {}", link.endpoint());
    } else {
        warn!("Heartbeat: failed to reconnect to {}", link.endpoint());
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
