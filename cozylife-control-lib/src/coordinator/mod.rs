use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::SwitchConfig;
use crate::device_link::DeviceLink;
use crate::util::catalog::Catalog;
use crate::util::frame::RegisterMap;

/// Register holding one bit per rocker.
pub const SWITCH_REGISTER: &str = "1";

/// Register 1 has room for eight rockers.
pub const MAX_ROCKERS: u8 = 8;

/// Pause between devices during setup and refresh.
pub const PACING_DELAY: Duration = Duration::from_millis(10);

/// One logical switch on a physical device, identified by its bit in register 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rocker(u8);

impl Rocker {
    pub const FIRST: Rocker = Rocker(0);
    pub const SECOND: Rocker = Rocker(1);

    /// Rocker by zero-based position.
    pub fn new(index: u8) -> anyhow::Result<Self> {
        if index >= MAX_ROCKERS {
            bail!("Rocker index {} out of range 0..{}", index, MAX_ROCKERS);
        }
        Ok(Rocker(index))
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    pub fn bit(&self) -> u64 {
        1 << self.0
    }

    pub fn label(&self) -> String {
        format!("rocker{}", self.0 + 1)
    }

    pub fn is_on(&self, register: u64) -> bool {
        register & self.bit() == self.bit()
    }

    /// New register 1 value with this rocker's bit set or cleared, other bits untouched.
    pub fn switch(&self, register: u64, on: bool) -> u64 {
        if on {
            register | self.bit()
        } else {
            register & !self.bit()
        }
    }
}

impl fmt::Display for Rocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One mutex per physical device, created on first use and kept for the registry's lifetime.
///
/// A device is first known by its address and later by its device id. Both keys resolve to
/// the same mutex once [`DeviceLocks::lock_for_link`] has seen the device id.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `device_key`. Every caller asking for the same key gets the same lock.
    pub fn lock_for(&self, device_key: &str) -> Arc<Mutex<()>> {
        lock(&self.locks)
            .entry(device_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The lock of the device behind `link`, registered under its address and, once known,
    /// its device id.
    pub fn lock_for_link(&self, link: &DeviceLink) -> Arc<Mutex<()>> {
        match link.device_id() {
            Some(device_id) => self.alias(link.address(), &device_id),
            None => self.lock_for(link.address()),
        }
    }

    /// Makes `key` and `known_key` share one lock. An existing lock under `key` wins, so a
    /// device bound twice (once by address, once by device id) ends up with a single lock.
    pub fn alias(&self, known_key: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.locks);
        let shared = match locks.get(key) {
            Some(existing) => existing.clone(),
            None => locks
                .entry(known_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        locks.insert(known_key.to_string(), shared.clone());
        locks.insert(key.to_string(), shared.clone());
        shared
    }

    /// Number of registered keys. A device known by address and device id counts twice.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a host platform needs from a switch entity.
pub trait SwitchEntity {
    fn unique_id(&self) -> String;
    fn name(&self) -> String;
    fn is_on(&self) -> bool;
    fn available(&self) -> bool;
}

#[derive(Debug, Default)]
struct EntityState {
    registers: Option<RegisterMap>,
    is_on: bool,
}

/// A rocker exposed as a switch entity.
///
/// All rockers of one device share its [`DeviceLink`] and its lock from [`DeviceLocks`].
/// Turning a rocker on or off queries register 1, flips this rocker's bit and writes the
/// result back, all while holding the lock, so rockers never overwrite each other's bits.
///
/// The lock, the unique id and the name follow [`DeviceLink::device_key`], so they switch
/// from the address to the device id as soon as the link learned it.
pub struct RockerSwitch {
    link: Arc<DeviceLink>,
    locks: Arc<DeviceLocks>,
    rocker: Rocker,
    optimistic: bool,
    state: StdMutex<EntityState>,
}

impl RockerSwitch {
    pub fn new(
        link: Arc<DeviceLink>,
        locks: Arc<DeviceLocks>,
        rocker: Rocker,
        optimistic: bool,
    ) -> Self {
        RockerSwitch {
            link,
            locks,
            rocker,
            optimistic,
            state: StdMutex::new(EntityState::default()),
        }
    }

    pub fn rocker(&self) -> Rocker {
        self.rocker
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// The lock serializing every register access of this entity's device.
    pub fn device_lock(&self) -> Arc<Mutex<()>> {
        self.locks.lock_for_link(&self.link)
    }

    /// The last register map seen, `None` while the state is unknown.
    pub fn state(&self) -> Option<RegisterMap> {
        lock(&self.state).registers.clone()
    }

    pub fn state_known(&self) -> bool {
        lock(&self.state).registers.is_some()
    }

    /// Refreshes this entity alone. Refreshing through [`SwitchCoordinator::refresh`] is
    /// cheaper when a device has several rockers.
    pub async fn update(&self) {
        if self.optimistic {
            return;
        }
        let device_lock = self.device_lock();
        let state = {
            let _guard = device_lock.lock().await;
            self.link.query().await
        };
        self.apply_state(state);
    }

    /// Records a queried register map. No I/O.
    pub fn apply_state(&self, registers: Option<RegisterMap>) {
        let mut state = lock(&self.state);
        if let Some(value) = registers
            .as_ref()
            .and_then(|registers| registers.get(SWITCH_REGISTER))
        {
            state.is_on = self.rocker.is_on(*value);
        }
        state.registers = registers;
    }

    pub async fn turn_on(&self) -> bool {
        self.switch_to(true).await
    }

    pub async fn turn_off(&self) -> bool {
        self.switch_to(false).await
    }

    async fn switch_to(&self, on: bool) -> bool {
        let unique_id = self.unique_id();
        let device_lock = self.device_lock();
        let _guard = device_lock.lock().await;

        // Another rocker or the device's own button may have changed register 1.
        let Some(registers) = self.link.query().await else {
            // Writing without the other rockers' bits would switch them off.
            warn!(
                "{}: cannot read register {}, not sending turn_{}",
                unique_id,
                SWITCH_REGISTER,
                if on { "on" } else { "off" }
            );
            self.apply_state(None);
            return false;
        };
        let current = registers.get(SWITCH_REGISTER).copied().unwrap_or(0);
        self.apply_state(Some(registers));
        let value = self.rocker.switch(current, on);
        info!(
            "{}: turn_{} current=0x{:02X} new=0x{:02X}",
            unique_id,
            if on { "on" } else { "off" },
            current,
            value
        );

        let command = RegisterMap::from([(SWITCH_REGISTER.to_string(), value)]);
        let acknowledged = self.link.control(&command).await;
        if !acknowledged {
            warn!("{}: device did not acknowledge 0x{:02X}", unique_id, value);
        }

        let mut state = lock(&self.state);
        state
            .registers
            .get_or_insert_with(RegisterMap::new)
            .insert(SWITCH_REGISTER.to_string(), value);
        state.is_on = on;
        acknowledged
    }
}

impl SwitchEntity for RockerSwitch {
    fn unique_id(&self) -> String {
        format!("{}_{}", self.link.device_key(), self.rocker.label())
    }

    fn name(&self) -> String {
        let key = self.link.device_key();
        let short_key = key
            .char_indices()
            .rev()
            .nth(3)
            .map(|(start, _)| &key[start..])
            .unwrap_or(&key);
        format!("cozylife:{} {}", short_key, self.rocker.label())
    }

    fn is_on(&self) -> bool {
        lock(&self.state).is_on
    }

    /// Connected, and (unless optimistic) with a known state.
    fn available(&self) -> bool {
        self.link.available() && (self.optimistic || self.state_known())
    }
}

impl fmt::Debug for RockerSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RockerSwitch")
            .field("unique_id", &self.unique_id())
            .field("rocker", &self.rocker)
            .field("is_on", &self.is_on())
            .field("available", &self.available())
            .finish()
    }
}

struct BoundDevice {
    key: String,
    /// The first link is queried on refresh. Further links come from configuration entries
    /// that turned out to name the same device.
    links: Vec<Arc<DeviceLink>>,
    entities: Vec<Arc<RockerSwitch>>,
}

impl BoundDevice {
    fn link(&self) -> &Arc<DeviceLink> {
        &self.links[0]
    }
}

/// Owns the links, locks and rocker entities of a switch setup.
///
/// Devices are keyed by [`DeviceLink::device_key`]; binding a second link for a key already
/// bound shares the first link instead. [`SwitchCoordinator::setup`] re-keys devices whose
/// device id it discovered and merges entries that turn out to be the same device.
pub struct SwitchCoordinator {
    locks: Arc<DeviceLocks>,
    devices: Vec<BoundDevice>,
    optimistic: bool,
}

impl SwitchCoordinator {
    pub fn new(optimistic: bool) -> Self {
        SwitchCoordinator {
            locks: Arc::new(DeviceLocks::new()),
            devices: Vec::new(),
            optimistic,
        }
    }

    pub fn from_config(config: &SwitchConfig) -> Self {
        Self::from_config_with_catalog(config, Catalog::global())
    }

    pub fn from_config_with_catalog(config: &SwitchConfig, catalog: Arc<Catalog>) -> Self {
        let mut coordinator = Self::new(config.optimistic);
        for device in &config.switches {
            let link = DeviceLink::with_catalog(device.clone(), catalog.clone());
            coordinator.add_device(link, &[Rocker::FIRST]);
        }
        for device in &config.switches2 {
            let link = DeviceLink::with_catalog(device.clone(), catalog.clone());
            coordinator.add_device(link, &[Rocker::FIRST, Rocker::SECOND]);
        }
        coordinator
    }

    /// Binds rocker entities for `rockers` of the device behind `link`.
    pub fn add_device(&mut self, link: DeviceLink, rockers: &[Rocker]) -> Vec<Arc<RockerSwitch>> {
        let optimistic = self.optimistic;
        let key = link.device_key();
        self.locks.lock_for_link(&link);
        let bound = self.devices.iter().position(|device| {
            device.key == key
                || (link.device_id().is_none() && device.link().address() == link.address())
        });
        let index = match bound {
            Some(index) => {
                debug!("Device {} is already bound, sharing its link", key);
                index
            }
            None => {
                self.devices.push(BoundDevice {
                    key,
                    links: vec![Arc::new(link)],
                    entities: Vec::new(),
                });
                self.devices.len() - 1
            }
        };

        let locks = self.locks.clone();
        let device = &mut self.devices[index];
        let mut added = Vec::new();
        for &rocker in rockers {
            if device.entities.iter().any(|entity| entity.rocker() == rocker) {
                warn!("Device {} already has {}", device.key, rocker);
                continue;
            }
            let entity = Arc::new(RockerSwitch::new(
                device.link().clone(),
                locks.clone(),
                rocker,
                optimistic,
            ));
            device.entities.push(entity.clone());
            added.push(entity);
        }
        added
    }

    pub fn entities(&self) -> Vec<Arc<RockerSwitch>> {
        self.devices
            .iter()
            .flat_map(|device| device.entities.iter().cloned())
            .collect()
    }

    /// One link per physical device, the one refresh queries.
    pub fn links(&self) -> Vec<Arc<DeviceLink>> {
        self.devices.iter().map(|device| device.link().clone()).collect()
    }

    pub fn locks(&self) -> &DeviceLocks {
        &self.locks
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    /// Connects every device once and resolves its identity, then re-keys the devices by
    /// the device ids found.
    pub async fn setup(&mut self) {
        for device in &self.devices {
            for link in &device.links {
                if link.connect().await {
                    link.fetch_identity().await;
                } else {
                    warn!("CozyLife device {} is not reachable", device.key);
                }
                self.locks.lock_for_link(link);
                sleep(PACING_DELAY).await;
            }
        }
        self.rekey();
    }

    fn rekey(&mut self) {
        for device in std::mem::take(&mut self.devices) {
            let key = device.link().device_key();
            if key != device.key {
                debug!("Device {} is now known as {}", device.key, key);
            }
            match self.devices.iter_mut().find(|bound| bound.key == key) {
                Some(bound) => {
                    info!("Configuration entries {} and {} are the same device", bound.key, device.key);
                    bound.links.extend(device.links);
                    for entity in device.entities {
                        if bound.entities.iter().any(|known| known.rocker() == entity.rocker()) {
                            warn!("Device {} already has {}, dropping the duplicate", key, entity.rocker());
                            continue;
                        }
                        bound.entities.push(entity);
                    }
                }
                None => self.devices.push(BoundDevice { key, ..device }),
            }
        }
    }

    /// Queries each device once under its lock and hands the result to all of its rockers.
    ///
    /// A device that cannot be queried leaves its rockers with an unknown state; the other
    /// devices are refreshed regardless. Returns how many devices answered.
    pub async fn refresh(&self) -> usize {
        if self.optimistic {
            return 0;
        }
        let mut answered = 0;
        for device in &self.devices {
            let device_lock = self.locks.lock_for_link(device.link());
            let registers = {
                let _guard = device_lock.lock().await;
                device.link().query().await
            };
            match registers {
                Some(_) => answered += 1,
                None => warn!("Failed to query CozyLife device {}", device.key),
            }
            for entity in &device.entities {
                entity.apply_state(registers.clone());
            }
            sleep(PACING_DELAY).await;
        }
        answered
    }

    /// Disconnects every device.
    pub async fn shutdown(&self) {
        for link in self.devices.iter().flat_map(|device| device.links.iter()) {
            link.disconnect().await;
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn offline_catalog() -> Arc<Catalog> {
        Arc::new(Catalog::preloaded(Vec::new()))
    }

    #[test]
    fn test_rocker_bits() {
        assert_eq!(Rocker::FIRST.bit(), 0x01);
        assert_eq!(Rocker::SECOND.bit(), 0x02);
        assert_eq!(Rocker::new(7).unwrap().bit(), 0x80);
        assert!(Rocker::new(8).is_err());
        assert_eq!(Rocker::SECOND.label(), "rocker2");
    }

    #[test]
    fn test_rocker_switch_keeps_other_bits() {
        assert_eq!(Rocker::FIRST.switch(0x00, true), 0x01);
        assert_eq!(Rocker::SECOND.switch(0x01, true), 0x03);
        assert_eq!(Rocker::FIRST.switch(0x03, false), 0x02);
        assert_eq!(Rocker::SECOND.switch(0x02, false), 0x00);
        assert_eq!(Rocker::FIRST.switch(0x02, false), 0x02);
        assert!(Rocker::SECOND.is_on(0x02));
        assert!(!Rocker::FIRST.is_on(0x02));
    }

    #[test]
    fn test_device_locks_are_shared_per_key() {
        let locks = DeviceLocks::new();
        assert!(locks.is_empty());
        let a = locks.lock_for("629168597cb94c4c1d8f");
        let b = locks.lock_for("629168597cb94c4c1d8f");
        let c = locks.lock_for("192.168.1.20");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_entity_naming() {
        let config = DeviceConfig::new("192.168.1.20").with_device_id("629168597cb94c4c1d8f");
        let link = Arc::new(DeviceLink::with_catalog(config, offline_catalog()));
        let entity = RockerSwitch::new(link, Arc::new(DeviceLocks::new()), Rocker::SECOND, false);
        assert_eq!(entity.unique_id(), "629168597cb94c4c1d8f_rocker2");
        assert_eq!(entity.name(), "cozylife:1d8f rocker2");
        assert!(!entity.available());
        assert!(!entity.is_on());
    }

    #[test]
    fn test_apply_state() {
        let link = Arc::new(DeviceLink::with_catalog(DeviceConfig::new("10.0.0.1"), offline_catalog()));
        let entity = RockerSwitch::new(link, Arc::new(DeviceLocks::new()), Rocker::SECOND, false);

        entity.apply_state(Some(RegisterMap::from([("1".to_string(), 0x02)])));
        assert!(entity.is_on());
        assert!(entity.state_known());

        // Unknown state keeps the last on/off reading.
        entity.apply_state(None);
        assert!(entity.is_on());
        assert!(!entity.state_known());

        entity.apply_state(Some(RegisterMap::from([("1".to_string(), 0x01)])));
        assert!(!entity.is_on());
    }

    #[test]
    fn test_config_binds_one_and_two_rockers() {
        let config = SwitchConfig {
            switches: vec![DeviceConfig::new("10.0.0.1").with_device_id("aaaa0001")],
            switches2: vec![DeviceConfig::new("10.0.0.2").with_device_id("bbbb0002")],
            optimistic: false,
        };
        let coordinator = SwitchCoordinator::from_config_with_catalog(&config, offline_catalog());
        let ids: Vec<String> = coordinator
            .entities()
            .iter()
            .map(|entity| entity.unique_id())
            .collect();
        assert_eq!(ids, vec!["aaaa0001_rocker1", "bbbb0002_rocker1", "bbbb0002_rocker2"]);
        assert_eq!(coordinator.links().len(), 2);
        // Each device is registered under its address and its device id.
        assert_eq!(coordinator.locks().len(), 4);
        assert!(Arc::ptr_eq(
            &coordinator.locks().lock_for("10.0.0.1"),
            &coordinator.locks().lock_for("aaaa0001")
        ));
    }

    #[test]
    fn test_alias_shares_lock() {
        let locks = DeviceLocks::new();
        let by_address = locks.lock_for("192.168.1.20");
        let by_id = locks.alias("192.168.1.20", "629168597cb94c4c1d8f");
        assert!(Arc::ptr_eq(&by_address, &by_id));
        assert!(Arc::ptr_eq(&by_id, &locks.lock_for("629168597cb94c4c1d8f")));

        // A device id that already has a lock keeps it and the address joins it.
        let existing = locks.lock_for("bbbb0002");
        let joined = locks.alias("10.0.0.2", "bbbb0002");
        assert!(Arc::ptr_eq(&existing, &joined));
        assert!(Arc::ptr_eq(&existing, &locks.lock_for("10.0.0.2")));
    }

    #[test]
    fn test_entity_lock_follows_device_key() {
        let locks = Arc::new(DeviceLocks::new());
        let link = Arc::new(DeviceLink::with_catalog(DeviceConfig::new("10.0.0.3"), offline_catalog()));
        let entity = RockerSwitch::new(link, locks.clone(), Rocker::FIRST, false);
        assert_eq!(entity.unique_id(), "10.0.0.3_rocker1");
        assert!(Arc::ptr_eq(&entity.device_lock(), &locks.lock_for("10.0.0.3")));
    }

    #[test]
    fn test_address_only_link_joins_bound_device() {
        let mut coordinator = SwitchCoordinator::new(false);
        coordinator.add_device(
            DeviceLink::with_catalog(DeviceConfig::new("10.0.0.4").with_device_id("dddd0004"), offline_catalog()),
            &[Rocker::FIRST],
        );
        let added = coordinator.add_device(
            DeviceLink::with_catalog(DeviceConfig::new("10.0.0.4"), offline_catalog()),
            &[Rocker::SECOND],
        );
        assert_eq!(added[0].unique_id(), "dddd0004_rocker2");
        assert_eq!(coordinator.links().len(), 1);
    }

    #[test]
    fn test_same_device_key_shares_link() {
        let mut coordinator = SwitchCoordinator::new(false);
        let first = DeviceLink::with_catalog(
            DeviceConfig::new("10.0.0.1").with_device_id("cccc0003"),
            offline_catalog(),
        );
        let again = DeviceLink::with_catalog(
            DeviceConfig::new("10.0.0.1").with_device_id("cccc0003"),
            offline_catalog(),
        );
        coordinator.add_device(first, &[Rocker::FIRST]);
        let added = coordinator.add_device(again, &[Rocker::FIRST, Rocker::SECOND]);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].rocker(), Rocker::SECOND);
        let entities = coordinator.entities();
        assert!(Arc::ptr_eq(entities[0].link(), entities[1].link()));
        assert_eq!(coordinator.links().len(), 1);
    }
}
