//! The device state store: the single source of truth the front end reads.
//!
//! Readings arrive from three concurrent sources (location stream, directory
//! poll, on-demand reads). The store serializes them behind one writer (the
//! broker event loop), tags every receipt with its provenance and a
//! monotonically increasing sequence number, and resolves which value a
//! selected device displays: an on-demand reading overrides streamed and
//! directory data until the selection changes.

use chrono::Local;
use std::collections::{BTreeSet, HashMap};

use cmind_proto::{DeviceId, DeviceKind, Location, SensorReading};

/// Which source produced a cached reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Stream,
    Directory,
    OnDemand,
}

#[derive(Debug, Clone)]
struct StoredReading {
    reading: SensorReading,
    source: ReadingSource,
    /// Receipt order across all sources. Assigned by the store, so a later
    /// receipt always carries a larger value than anything already cached.
    seq: u64,
}

/// Latest value for one display slot (temperature or humidity card).
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSlot {
    pub value: f64,
    pub unit: String,
    pub timestamp: i64,
}

impl SensorSlot {
    fn from_reading(reading: &SensorReading) -> Self {
        Self {
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: reading.timestamp,
        }
    }
}

/// Detail card for the selected device. `on_demand` is set when the shown
/// reading is an on-demand override rather than directory data.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDetail {
    pub reading: SensorReading,
    pub on_demand: bool,
}

/// Read-only snapshot handed to subscribers. Consistent at the instant it
/// was taken; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisplayState {
    pub location: Location,
    pub temperature: Option<SensorSlot>,
    pub humidity: Option<SensorSlot>,
    pub devices: Vec<SensorReading>,
    /// Locations with at least one active alarm, deduplicated and sorted.
    pub active_alarms: Vec<Location>,
    pub selected: Option<DeviceDetail>,
    pub status: String,
}

#[derive(Debug)]
pub struct DeviceStateStore {
    location: Location,
    devices: Vec<SensorReading>,
    cache: HashMap<DeviceId, StoredReading>,
    temperature: Option<SensorSlot>,
    humidity: Option<SensorSlot>,
    selected: Option<DeviceId>,
    override_read: Option<StoredReading>,
    active_alarms: BTreeSet<Location>,
    status: String,
    next_seq: u64,
}

impl DeviceStateStore {
    pub fn new(location: Location) -> Self {
        Self {
            status: format!("Connecting to location {location}..."),
            location,
            devices: Vec::new(),
            cache: HashMap::new(),
            temperature: None,
            humidity: None,
            selected: None,
            override_read: None,
            active_alarms: BTreeSet::new(),
            next_seq: 0,
        }
    }

    fn stamp(&mut self, mut reading: SensorReading, source: ReadingSource) -> StoredReading {
        if reading.timestamp == 0 {
            reading.timestamp = Local::now().timestamp();
        }
        self.next_seq += 1;
        let stored = StoredReading {
            reading,
            source,
            seq: self.next_seq,
        };
        self.cache
            .insert(stored.reading.sensor_id.clone(), stored.clone());
        stored
    }

    /// Replace the device directory wholesale. Recomputes the active-alarm
    /// set from the new directory and drops the selection (and any override)
    /// when the selected device is no longer listed.
    pub fn apply_directory(&mut self, readings: Vec<SensorReading>) {
        for reading in &readings {
            self.stamp(reading.clone(), ReadingSource::Directory);
        }

        self.active_alarms = readings
            .iter()
            .filter(|r| r.is_active_alarm())
            .map(|r| r.location.clone())
            .collect();

        if let Some(id) = &self.selected {
            if !readings.iter().any(|r| &r.sensor_id == id) {
                self.selected = None;
                self.override_read = None;
            }
        }

        self.devices = readings;
    }

    /// Directory poll failed: show nothing rather than devices that may no
    /// longer exist.
    pub fn directory_failure(&mut self, message: &str) {
        self.devices.clear();
        self.active_alarms.clear();
        self.selected = None;
        self.override_read = None;
        self.status = format!("Device list unavailable: {message}");
    }

    /// Route one streamed reading. Readings for a location other than the
    /// current one are dropped here; a stream loop being torn down may still
    /// have deliveries in flight.
    pub fn apply_streamed(&mut self, reading: SensorReading) {
        if reading.location != self.location {
            log::debug!(
                "dropping stale streamed reading for location {:}",
                reading.location
            );
            return;
        }

        let stored = self.stamp(reading, ReadingSource::Stream);
        match stored.reading.sensor_type {
            DeviceKind::Temperature => self.temperature = Some(SensorSlot::from_reading(&stored.reading)),
            DeviceKind::Humidity => self.humidity = Some(SensorSlot::from_reading(&stored.reading)),
            _ => {}
        }
        self.status = format!("Last update {}", Local::now().format("%H:%M:%S"));
    }

    /// Record an on-demand reading. For the currently selected device it
    /// becomes the display override until the selection changes; receipt
    /// order guards against an out-of-order one-shot clobbering a fresher
    /// override.
    pub fn apply_on_demand(&mut self, reading: SensorReading) {
        let stored = self.stamp(reading, ReadingSource::OnDemand);
        if self.selected.as_deref() != Some(stored.reading.sensor_id.as_str()) {
            return;
        }
        let fresher = self
            .override_read
            .as_ref()
            .map_or(true, |current| stored.seq > current.seq);
        if fresher {
            self.status = format!("[{:}] reading updated", stored.reading.sensor_id);
            self.override_read = Some(stored);
        }
    }

    /// Change (or clear) the device selection. Any on-demand override is
    /// scoped to one selection and is dropped here, even when reselecting
    /// the same device.
    pub fn select_device(&mut self, device_id: Option<DeviceId>) {
        self.selected = device_id;
        self.override_read = None;
    }

    /// Switch to a new location, resetting every location-scoped slot.
    pub fn select_location(&mut self, location: Location) {
        self.status = format!("Connecting to location {location}...");
        self.location = location;
        self.temperature = None;
        self.humidity = None;
    }

    /// Transient feedback for a one-shot action against one device.
    pub fn action_status(&mut self, device_id: &str, message: &str) {
        self.status = format!("[{device_id}] {message}");
    }

    /// The location stream dropped; the loop is already backing off.
    pub fn stream_failure(&mut self, message: &str) {
        self.status = format!("Location stream error: {message}");
    }

    /// Take a consistent snapshot of everything the front end renders.
    pub fn view(&self) -> DisplayState {
        let selected = self.selected.as_ref().and_then(|id| {
            if let Some(over) = &self.override_read {
                if &over.reading.sensor_id == id {
                    return Some(DeviceDetail {
                        reading: over.reading.clone(),
                        on_demand: true,
                    });
                }
            }
            self.devices
                .iter()
                .find(|r| &r.sensor_id == id)
                .map(|r| DeviceDetail {
                    reading: r.clone(),
                    on_demand: false,
                })
        });

        DisplayState {
            location: self.location.clone(),
            temperature: self.temperature.clone(),
            humidity: self.humidity.clone(),
            devices: self.devices.clone(),
            active_alarms: self.active_alarms.iter().cloned().collect(),
            selected,
            status: self.status.clone(),
        }
    }

    /// Provenance of the latest cached reading for a device, if any.
    pub fn source_of(&self, device_id: &str) -> Option<ReadingSource> {
        self.cache.get(device_id).map(|stored| stored.source)
    }
}
