use rsis_model_abi::{BufferStruct, ChannelStatus, HostChannels};
use std::os::raw::c_void;

/// Channel access handed to `Model::init`.
///
/// Only usable during `init`; the ends it returns live as long as the model
/// keeps them.
pub struct Channels<'a> {
    host: Option<&'a HostChannels>,
}

impl<'a> Channels<'a> {
    pub fn new(host: Option<&'a HostChannels>) -> Self {
        Self { host }
    }

    /// No host table, every request fails
    pub fn detached() -> Self {
        Self { host: None }
    }

    /// Receiving end of channel `id`. `None` when another model already
    /// took it or no host table was supplied.
    pub fn request_rx(&mut self, id: i64) -> Option<ChannelRx> {
        let host = self.host?;
        let handle = unsafe { (host.request_rx)(host.ctx, id) };
        (!handle.is_null()).then(|| ChannelRx {
            handle,
            host: *host,
        })
    }

    pub fn request_tx(&mut self, id: i64) -> Option<ChannelTx> {
        let host = self.host?;
        let handle = unsafe { (host.request_tx)(host.ctx, id) };
        (!handle.is_null()).then(|| ChannelTx {
            handle,
            host: *host,
        })
    }
}

pub struct ChannelTx {
    handle: *mut c_void,
    host: HostChannels,
}

// Safety: the handle is an owned host sender, used only through `&mut self`
unsafe impl Send for ChannelTx {}

impl ChannelTx {
    pub fn send(&mut self, data: &[u8]) -> Result<(), ChannelStatus> {
        let status = unsafe { (self.host.send)(self.handle, BufferStruct::from_slice(data)) };
        match ChannelStatus::from_raw(status) {
            ChannelStatus::Ok => Ok(()),
            status => Err(status),
        }
    }
}

impl Drop for ChannelTx {
    fn drop(&mut self) {
        unsafe { (self.host.release_tx)(self.handle) };
    }
}

pub struct ChannelRx {
    handle: *mut c_void,
    host: HostChannels,
}

// Safety: the handle is an owned host receiver, used only through `&mut self`
unsafe impl Send for ChannelRx {}

unsafe extern "C" fn grow(ctx: *mut c_void, size: usize) -> *mut u8 {
    let buf = &mut *(ctx as *mut Vec<u8>);
    buf.resize(size, 0);
    buf.as_mut_ptr()
}

impl ChannelRx {
    fn receive(&mut self, block: bool) -> Result<Vec<u8>, ChannelStatus> {
        let mut buf: Vec<u8> = Vec::new();
        let status = unsafe {
            (self.host.recv)(self.handle, block, grow, &mut buf as *mut Vec<u8> as *mut c_void)
        };
        match ChannelStatus::from_raw(status) {
            ChannelStatus::Ok => Ok(buf),
            status => Err(status),
        }
    }

    /// Block until a message arrives or every sender is gone
    pub fn recv(&mut self) -> Result<Vec<u8>, ChannelStatus> {
        self.receive(true)
    }

    /// `Err(ChannelStatus::Empty)` when nothing is queued
    pub fn try_recv(&mut self) -> Result<Vec<u8>, ChannelStatus> {
        self.receive(false)
    }
}

impl Drop for ChannelRx {
    fn drop(&mut self) {
        unsafe { (self.host.release_rx)(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_channels_are_unavailable() {
        let mut channels = Channels::detached();
        assert!(channels.request_rx(0).is_none());
        assert!(channels.request_tx(0).is_none());
    }
}
