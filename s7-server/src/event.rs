//! Server events: what happened, to whom, and a bounded queue to pick them from.
use std::{
    collections::VecDeque,
    fmt::Display,
    net::IpAddr,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU32, Ordering},
    },
};

use chrono::{Local, NaiveDateTime};
use s7_protocol::types::Area;

pub const SERVER_STARTED: u32 = 0x0000_0001;
pub const SERVER_STOPPED: u32 = 0x0000_0002;
pub const LISTENER_CANNOT_START: u32 = 0x0000_0004;
pub const CLIENT_ADDED: u32 = 0x0000_0008;
pub const CLIENT_REJECTED: u32 = 0x0000_0010;
pub const CLIENT_NO_ROOM: u32 = 0x0000_0020;
pub const CLIENT_EXCEPTION: u32 = 0x0000_0040;
pub const CLIENT_DISCONNECTED: u32 = 0x0000_0080;
pub const CLIENT_TERMINATED: u32 = 0x0000_0100;
pub const CLIENTS_DROPPED: u32 = 0x0000_0200;

pub const PDU_INCOMING: u32 = 0x0001_0000;
pub const DATA_READ: u32 = 0x0002_0000;
pub const DATA_WRITE: u32 = 0x0004_0000;
pub const NEGOTIATE_PDU: u32 = 0x0008_0000;
pub const READ_SZL: u32 = 0x0010_0000;
pub const CLOCK: u32 = 0x0020_0000;
pub const UPLOAD: u32 = 0x0040_0000;
pub const DOWNLOAD: u32 = 0x0080_0000;
pub const DIRECTORY: u32 = 0x0100_0000;
pub const SECURITY: u32 = 0x0200_0000;
pub const CONTROL: u32 = 0x0400_0000;

/// Events kept until picked; newer events are dropped once full.
pub const QUEUE_CAPACITY: usize = 1500;

/// Something the server did or was asked to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub time: NaiveDateTime,
    pub sender: Option<IpAddr>,
    pub code: u32,
    /// Zero on success, otherwise the error code of the answer.
    pub ret_code: u16,
    pub params: [u16; 4],
}

impl Event {
    pub fn new(sender: Option<IpAddr>, code: u32, ret_code: u16, params: [u16; 4]) -> Event {
        Event {
            time: Local::now().naive_local(),
            sender,
            code,
            ret_code,
            params,
        }
    }

    fn description(&self) -> String {
        let [p1, p2, p3, p4] = self.params;
        let outcome = if self.ret_code == 0 {
            "OK".to_string()
        } else {
            format!("error {:#06x}", self.ret_code)
        };
        match self.code {
            SERVER_STARTED => "Server started".to_string(),
            SERVER_STOPPED => "Server stopped".to_string(),
            LISTENER_CANNOT_START => format!("Listener cannot start (os error {})", self.ret_code),
            CLIENT_ADDED => "Client added".to_string(),
            CLIENT_REJECTED => "Client refused".to_string(),
            CLIENT_NO_ROOM => "A client was refused due to maximum connections number".to_string(),
            CLIENT_EXCEPTION => "Client exception".to_string(),
            CLIENT_DISCONNECTED => "Client disconnected by peer".to_string(),
            CLIENT_TERMINATED => "Client terminated".to_string(),
            CLIENTS_DROPPED => format!("{} clients have been dropped", p1),
            PDU_INCOMING => "PDU incoming".to_string(),
            DATA_READ | DATA_WRITE => {
                let verb = if self.code == DATA_READ { "Read" } else { "Write" };
                let area = match Area::from_code(p1 as u8) {
                    Some(Area::DB) => format!("DB{}", p4),
                    Some(area) => area.to_string(),
                    None => format!("area {:#04x}", p1),
                };
                format!("{} request, {} Start: {} Size: {} --> {}", verb, area, p2, p3, outcome)
            }
            NEGOTIATE_PDU => format!("The client requires a PDU size of {} bytes", p1),
            READ_SZL => format!("Read SZL request, ID:{:#06x} INDEX:{:#06x} --> {}", p1, p2, outcome),
            CLOCK => match p1 {
                0 => format!("System clock read requested --> {}", outcome),
                _ => format!("System clock write requested --> {}", outcome),
            },
            UPLOAD => format!("Block upload requested --> {}", outcome),
            DOWNLOAD => format!("Block download requested --> {}", outcome),
            DIRECTORY => format!("Block directory requested --> {}", outcome),
            SECURITY => match p1 {
                0 => format!("Security request: set session password --> {}", outcome),
                _ => format!("Security request: clear session password --> {}", outcome),
            },
            CONTROL => match p1 {
                0 => format!("CPU control request: STOP --> {}", outcome),
                1 => format!("CPU control request: hot START --> {}", outcome),
                _ => format!("CPU control request: cold START --> {}", outcome),
            },
            other => format!("Unknown event {:#010x}", other),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sender = match self.sender {
            Some(ip) => ip.to_string(),
            None => "Server".to_string(),
        };
        write!(
            f,
            "{} [{}] {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            sender,
            self.description()
        )
    }
}

/// One line of text describing `event`.
pub fn event_text(event: &Event) -> String {
    event.to_string()
}

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Bounded event queue with a filter mask and an optional callback.
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    mask: AtomicU32,
    callback: RwLock<Option<EventCallback>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue {
            events: Mutex::new(VecDeque::new()),
            mask: AtomicU32::new(u32::MAX),
            callback: RwLock::new(None),
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("mask", &format_args!("{:#010x}", self.get_mask()))
            .finish_non_exhaustive()
    }
}

impl EventQueue {
    pub fn push(&self, event: Event) {
        if event.code & self.get_mask() == 0 {
            return;
        }
        log::trace!("Event: {}", event);
        let callback = self
            .callback
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&event);
        }
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() < QUEUE_CAPACITY {
            events.push_back(event);
        }
    }

    /// Removes and returns the oldest event.
    pub fn pick(&self) -> Option<Event> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_mask(&self) -> u32 {
        self.mask.load(Ordering::Relaxed)
    }

    pub fn set_mask(&self, mask: u32) {
        self.mask.store(mask, Ordering::Relaxed);
    }

    pub fn set_callback(&self, callback: Option<EventCallback>) {
        *self.callback.write().unwrap_or_else(|p| p.into_inner()) = callback;
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn queue_is_bounded_and_masked() {
        let queue = EventQueue::default();
        for _ in 0..QUEUE_CAPACITY + 10 {
            queue.push(Event::new(None, PDU_INCOMING, 0, [0; 4]));
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        queue.clear();
        assert!(queue.pick().is_none());

        queue.set_mask(!PDU_INCOMING);
        queue.push(Event::new(None, PDU_INCOMING, 0, [0; 4]));
        queue.push(Event::new(None, SERVER_STARTED, 0, [0; 4]));
        assert_eq!(queue.pick().map(|e| e.code), Some(SERVER_STARTED));
        assert!(queue.is_empty());
    }

    #[test]
    fn callback_sees_every_event() {
        let queue = EventQueue::default();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        queue.set_callback(Some(Arc::new(move |event: &Event| {
            counter.fetch_or(event.code, Ordering::SeqCst);
        })));
        queue.push(Event::new(None, CLIENT_ADDED, 0, [0; 4]));
        queue.push(Event::new(None, DATA_READ, 0, [0; 4]));
        assert_eq!(seen.load(Ordering::SeqCst), CLIENT_ADDED | DATA_READ);
    }

    #[test]
    fn text() {
        let event = Event::new(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            DATA_READ,
            0,
            [Area::DB.code() as u16, 10, 4, 1],
        );
        let text = event_text(&event);
        assert!(text.contains("[127.0.0.1]"), "{}", text);
        assert!(text.ends_with("Read request, DB1 Start: 10 Size: 4 --> OK"), "{}", text);
        let stopped = Event::new(None, SERVER_STOPPED, 0, [0; 4]);
        assert!(event_text(&stopped).ends_with("[Server] Server stopped"));
    }
}
