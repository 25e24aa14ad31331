// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Monitor events published on the `_IPS_MONITOR` topic.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fs::{
        File,
        OpenOptions,
    },
    io::Write,
    path::Path,
    sync::{
        Arc,
        Mutex,
    },
    time::Instant,
};

//==============================================================================
// Constants
//==============================================================================

pub const MONITOR_TOPIC: &str = "_IPS_MONITOR";

//==============================================================================
// Structures
//==============================================================================

/// One monitor event.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorEvent {
    pub sim_name: String,
    pub eventtype: String,
    /// Component that produced the event.
    pub code: String,
    pub comment: String,
    pub ok: bool,
    pub phystimestamp: Option<f64>,
    /// Seconds since the workflow started; stamped by the hub.
    pub walltime: f64,
    /// Position within the workflow's event stream; stamped by the hub.
    pub seqnum: u64,
    pub extra: BTreeMap<String, String>,
}

/// Destination of stamped events.
pub trait EventSink: Send {
    fn publish(&mut self, topic: &str, event: &MonitorEvent) -> Result<(), Fail>;
}

/// Writes events to the log.
pub struct LogSink;

/// Appends events to a file, one `key=value` line each.
pub struct FileSink {
    file: File,
}

/// Keeps events in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
}

struct Stream {
    started: Instant,
    next_seqnum: u64,
}

/// Event Hub
///
/// Stamps every event with a per-workflow sequence number and wall time, then
/// forwards it to the sink.
pub struct EventHub {
    sink: Box<dyn EventSink>,
    streams: HashMap<String, Stream>,
    portal_names: HashMap<String, String>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MonitorEvent {
    pub fn new(sim_name: &str, eventtype: &str, code: &str, comment: &str) -> Self {
        Self {
            sim_name: sim_name.to_string(),
            eventtype: eventtype.to_string(),
            code: code.to_string(),
            comment: comment.to_string(),
            ok: true,
            phystimestamp: None,
            walltime: 0.0,
            seqnum: 0,
            extra: BTreeMap::new(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.ok = false;
        self
    }

    pub fn with_ok(mut self, ok: bool) -> Self {
        self.ok = ok;
        self
    }

    pub fn at(mut self, phystimestamp: f64) -> Self {
        self.phystimestamp = Some(phystimestamp);
        self
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    fn render(&self) -> String {
        let mut line: String = format!(
            "sim_name={} seqnum={} eventtype={} code={} ok={} walltime={:.2}",
            self.sim_name, self.seqnum, self.eventtype, self.code, self.ok, self.walltime
        );
        if let Some(t) = self.phystimestamp {
            line.push_str(&format!(" phystimestamp={}", t));
        }
        for (k, v) in self.extra.iter() {
            line.push_str(&format!(" {}={:?}", k, v));
        }
        line.push_str(&format!(" comment={:?}", self.comment));
        line
    }
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self, Fail> {
        if let Some(parent) = path.parent() {
            ::std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event published so far.
    pub fn events(&self) -> Vec<MonitorEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl EventHub {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink,
            streams: HashMap::new(),
            portal_names: HashMap::new(),
        }
    }

    /// Makes `sim_name` publish under the stream of `portal_name`, as
    /// sub-workflows do with their parent.
    pub fn alias(&mut self, sim_name: &str, portal_name: &str) {
        self.portal_names.insert(sim_name.to_string(), portal_name.to_string());
    }

    /// Stamps and forwards one event.
    pub fn publish(&mut self, mut event: MonitorEvent) {
        let stream_name: String = match self.portal_names.get(&event.sim_name) {
            Some(name) => name.clone(),
            None => event.sim_name.clone(),
        };
        let stream: &mut Stream = self.streams.entry(stream_name).or_insert_with(|| Stream {
            started: Instant::now(),
            next_seqnum: 0,
        });
        event.seqnum = stream.next_seqnum;
        event.walltime = stream.started.elapsed().as_secs_f64();
        stream.next_seqnum += 1;
        if let Err(e) = self.sink.publish(MONITOR_TOPIC, &event) {
            warn!("publish(): cannot publish {} ({:?})", event.eventtype, e);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl EventSink for LogSink {
    fn publish(&mut self, topic: &str, event: &MonitorEvent) -> Result<(), Fail> {
        info!("{}: {}", topic, event.render());
        Ok(())
    }
}

impl EventSink for FileSink {
    fn publish(&mut self, topic: &str, event: &MonitorEvent) -> Result<(), Fail> {
        writeln!(self.file, "topic={} {}", topic, event.render())?;
        Ok(())
    }
}

impl EventSink for MemorySink {
    fn publish(&mut self, _topic: &str, event: &MonitorEvent) -> Result<(), Fail> {
        match self.events.lock() {
            Ok(mut events) => {
                events.push(event.clone());
                Ok(())
            },
            Err(_) => Err(Fail::new(libc::EIO, "event store poisoned")),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
