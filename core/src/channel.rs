//! Byte channels models open on each other during init, keyed by an id.
//!
//! Every id names one mpsc pair. Any number of senders can be handed out,
//! the receiving end only once.

use rsis_model_abi::{BufferStruct, ChannelStatus, HostChannels, SizeCallback};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Pair {
    tx: Sender<Vec<u8>>,
    rx: Option<Receiver<Vec<u8>>>,
}

impl Pair {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx: Some(rx) }
    }
}

type Pairs = Mutex<HashMap<i64, Pair>>;

#[derive(Clone, Default)]
pub struct ChannelRegistry {
    pairs: Arc<Pairs>,
}

fn lock(pairs: &Pairs) -> MutexGuard<'_, HashMap<i64, Pair>> {
    pairs.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The receiving end of channel `id`, `None` once it was handed out
    pub fn request_rx(&self, id: i64) -> Option<Receiver<Vec<u8>>> {
        take_rx(&self.pairs, id)
    }

    pub fn request_tx(&self, id: i64) -> Sender<Vec<u8>> {
        new_tx(&self.pairs, id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pairs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every channel. Ends already handed out keep working with
    /// each other but are unreachable by id.
    pub fn clear(&self) {
        let mut pairs = lock(&self.pairs);
        if !pairs.is_empty() {
            log::debug!("Dropping {} channel(s)", pairs.len());
        }
        pairs.clear();
    }

    /// C view of the registry for plugin models. Valid while `self` lives.
    pub fn host_table(&self) -> HostChannels {
        HostChannels {
            ctx: Arc::as_ptr(&self.pairs) as *mut c_void,
            request_rx: host_request_rx,
            request_tx: host_request_tx,
            send: host_send,
            recv: host_recv,
            release_rx: host_release_rx,
            release_tx: host_release_tx,
        }
    }
}

fn take_rx(pairs: &Pairs, id: i64) -> Option<Receiver<Vec<u8>>> {
    let rx = lock(pairs).entry(id).or_insert_with(Pair::new).rx.take();
    if rx.is_none() {
        log::warn!("Receiver of channel {} was already taken", id);
    }
    rx
}

fn new_tx(pairs: &Pairs, id: i64) -> Sender<Vec<u8>> {
    lock(pairs).entry(id).or_insert_with(Pair::new).tx.clone()
}

// --- HOST TABLE ---

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(fallback)
}

unsafe extern "C" fn host_request_rx(ctx: *mut c_void, id: i64) -> *mut c_void {
    let Some(pairs) = (ctx as *const Pairs).as_ref() else {
        return std::ptr::null_mut();
    };
    guarded(std::ptr::null_mut(), || match take_rx(pairs, id) {
        Some(rx) => Box::into_raw(Box::new(rx)) as *mut c_void,
        None => std::ptr::null_mut(),
    })
}

unsafe extern "C" fn host_request_tx(ctx: *mut c_void, id: i64) -> *mut c_void {
    let Some(pairs) = (ctx as *const Pairs).as_ref() else {
        return std::ptr::null_mut();
    };
    guarded(std::ptr::null_mut(), || {
        Box::into_raw(Box::new(new_tx(pairs, id))) as *mut c_void
    })
}

unsafe extern "C" fn host_send(tx: *mut c_void, data: BufferStruct) -> u32 {
    let Some(tx) = (tx as *const Sender<Vec<u8>>).as_ref() else {
        return ChannelStatus::Error as u32;
    };
    let message = data.as_slice().to_vec();
    match tx.send(message) {
        Ok(()) => ChannelStatus::Ok as u32,
        Err(_) => ChannelStatus::Disconnected as u32,
    }
}

unsafe extern "C" fn host_recv(
    rx: *mut c_void,
    block: bool,
    cb: SizeCallback,
    cb_ctx: *mut c_void,
) -> u32 {
    let Some(rx) = (rx as *const Receiver<Vec<u8>>).as_ref() else {
        return ChannelStatus::Error as u32;
    };
    let message = if block {
        rx.recv().map_err(|RecvError| ChannelStatus::Disconnected)
    } else {
        rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => ChannelStatus::Empty,
            TryRecvError::Disconnected => ChannelStatus::Disconnected,
        })
    };
    match message {
        Ok(message) => {
            let dst = cb(cb_ctx, message.len());
            if dst.is_null() {
                return ChannelStatus::Error as u32;
            }
            std::ptr::copy_nonoverlapping(message.as_ptr(), dst, message.len());
            ChannelStatus::Ok as u32
        }
        Err(status) => status as u32,
    }
}

unsafe extern "C" fn host_release_rx(rx: *mut c_void) {
    if !rx.is_null() {
        drop(Box::from_raw(rx as *mut Receiver<Vec<u8>>));
    }
}

unsafe extern "C" fn host_release_tx(tx: *mut c_void) {
    if !tx.is_null() {
        drop(Box::from_raw(tx as *mut Sender<Vec<u8>>));
    }
}
