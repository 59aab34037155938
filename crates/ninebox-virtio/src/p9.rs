//! VirtIO 9P transport device (device id 9).
//!
//! The guest mounts the export with
//! `mount -t 9p -o trans=virtio,version=9p2000.L host9p /mnt`. The device
//! advertises its mount tag through the config space, pops request frames
//! off the virtqueue, hands each to the protocol dispatcher as its own
//! task, and writes completed replies back into the chain's writable
//! descriptors.
//!
//! An unknown message id is session-fatal: the device flips to
//! DEVICE_NEEDS_RESET and stops serving the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ninebox_9p::{Backend, Dispatcher, NinepConfig, Reply, SessionSnapshot, DEFAULT_MSIZE};

use crate::error::Result;
use crate::queue::{write_into_slots, VirtQueue};
use crate::{DeviceStatus, VirtioDevice, VirtioDeviceId};

/// Host feature bits: bit 0 advertises the mount tag.
pub const FEATURE_MOUNT_TAG: u64 = 0x1;

/// Default mount tag the guest uses to identify the export.
pub const DEFAULT_MOUNT_TAG: &str = "host9p";

/// 9P device configuration.
#[derive(Debug, Clone)]
pub struct P9Config {
    /// Mount tag exposed through the config space.
    pub mount_tag: String,
    /// Virtqueue size.
    pub queue_size: u16,
    /// Server msize cap handed to the dispatcher.
    pub msize: u32,
}

impl Default for P9Config {
    fn default() -> Self {
        Self {
            mount_tag: DEFAULT_MOUNT_TAG.to_string(),
            queue_size: 128,
            msize: DEFAULT_MSIZE,
        }
    }
}

/// Serializable device state for save/restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// VirtIO device id (always 9).
    pub device_id: u32,
    /// Host feature bits.
    pub host_features: u64,
    /// Raw config space (length-prefixed mount tag).
    pub config_space: Vec<u8>,
    /// Protocol session state.
    pub session: SessionSnapshot,
}

/// The virtio-9P device.
pub struct Virtio9p<B> {
    config: P9Config,
    dispatcher: Arc<Dispatcher<B>>,
    replies: mpsc::UnboundedReceiver<Reply>,
    queue: VirtQueue,
    /// Reply slots of chains whose requests are in flight, by head index.
    pending: HashMap<u16, Vec<(u64, u32)>>,
    acked_features: u64,
    interrupt_status: u32,
    status: DeviceStatus,
    failed: Arc<AtomicBool>,
}

impl<B: Backend + 'static> Virtio9p<B> {
    /// Creates a device over a backend.
    ///
    /// # Errors
    ///
    /// Fails if the configured queue size is invalid.
    pub fn new(backend: Arc<B>, config: P9Config) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Reply>();
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            Arc::new(tx),
            NinepConfig {
                msize: config.msize,
            },
        ));
        let queue = VirtQueue::new(config.queue_size)?;
        Ok(Self {
            config,
            dispatcher,
            replies: rx,
            queue,
            pending: HashMap::new(),
            acked_features: 0,
            interrupt_status: 0,
            status: DeviceStatus::new(0),
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The mount tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.config.mount_tag
    }

    /// Queue access for the driver side (tests and the VMM glue).
    pub fn queue_mut(&mut self) -> &mut VirtQueue {
        &mut self.queue
    }

    /// True once a protocol violation has killed the session.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Current device status word.
    #[must_use]
    pub const fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Raised interrupt pending acknowledgement.
    #[must_use]
    pub const fn has_interrupt(&self) -> bool {
        self.interrupt_status != 0
    }

    /// Acknowledges the interrupt.
    pub fn ack_interrupt(&mut self) {
        self.interrupt_status = 0;
    }

    /// Pops every posted chain and dispatches its request. Returns the
    /// number of chains taken. Replies arrive asynchronously; collect them
    /// with [`Self::flush_replies`] or [`Self::next_reply`].
    ///
    /// Must run inside a tokio runtime: each request becomes a task.
    pub fn process_queue(&mut self, ram: &[u8]) -> usize {
        if self.is_failed() {
            tracing::warn!("9p session failed; queue is no longer served");
            return 0;
        }

        let mut taken = 0;
        while let Some(head) = self.queue.pop_available() {
            let chain = match self.queue.collect_chain(ram, head) {
                Ok(chain) => chain,
                Err(err) => {
                    tracing::warn!("dropping bad descriptor chain {}: {}", head, err);
                    self.queue.push_used(head, 0);
                    continue;
                }
            };

            self.pending.insert(head, chain.reply_slots);
            let dispatcher = Arc::clone(&self.dispatcher);
            let failed = Arc::clone(&self.failed);
            let frame = chain.request;
            tokio::spawn(async move {
                if let Err(err) = dispatcher.dispatch(head, &frame).await {
                    tracing::error!("9p session fatal: {}", err);
                    failed.store(true, Ordering::SeqCst);
                }
            });
            taken += 1;
        }
        taken
    }

    /// Drains completed replies into guest memory without waiting.
    /// Returns the number delivered.
    pub fn flush_replies(&mut self, ram: &mut [u8]) -> usize {
        let mut delivered = 0;
        while let Ok(reply) = self.replies.try_recv() {
            if self.deliver(ram, &reply) {
                delivered += 1;
            }
        }
        if self.is_failed() {
            self.status.set(DeviceStatus::DEVICE_NEEDS_RESET);
        }
        delivered
    }

    /// Waits for one reply and delivers it, returning its chain head.
    pub async fn next_reply(&mut self, ram: &mut [u8]) -> Option<u16> {
        let reply = self.replies.recv().await?;
        let head = reply.index;
        self.deliver(ram, &reply);
        Some(head)
    }

    fn deliver(&mut self, ram: &mut [u8], reply: &Reply) -> bool {
        let Some(slots) = self.pending.remove(&reply.index) else {
            tracing::warn!("reply for unknown chain {}", reply.index);
            return false;
        };
        match write_into_slots(ram, &slots, &reply.frame) {
            Ok(written) => {
                #[allow(clippy::cast_possible_truncation)] // bounded by slot capacity
                self.queue.push_used(reply.index, written as u32);
                self.interrupt_status |= 1;
                true
            }
            Err(err) => {
                tracing::warn!("reply for chain {} dropped: {}", reply.index, err);
                self.queue.push_used(reply.index, 0);
                true
            }
        }
    }

    fn config_space(&self) -> Vec<u8> {
        let tag = self.config.mount_tag.as_bytes();
        #[allow(clippy::cast_possible_truncation)] // tags are short strings
        let len = tag.len() as u16;
        let mut space = Vec::with_capacity(2 + tag.len());
        space.extend_from_slice(&len.to_le_bytes());
        space.extend_from_slice(tag);
        space
    }

    /// Captures restorable device state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        DeviceState {
            device_id: VirtioDeviceId::NineP as u32,
            host_features: FEATURE_MOUNT_TAG,
            config_space: self.config_space(),
            session: self.dispatcher.snapshot(),
        }
    }

    /// Restores device state captured by [`Self::state`].
    pub fn restore(&mut self, state: DeviceState) {
        if state.config_space.len() >= 2 {
            let len = u16::from_le_bytes([state.config_space[0], state.config_space[1]]) as usize;
            if let Some(tag) = state
                .config_space
                .get(2..2 + len)
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
            {
                self.config.mount_tag = tag.to_string();
            }
        }
        self.dispatcher.restore(state.session);
    }
}

impl<B: Backend + 'static> VirtioDevice for Virtio9p<B> {
    fn device_id(&self) -> VirtioDeviceId {
        VirtioDeviceId::NineP
    }

    fn features(&self) -> u64 {
        FEATURE_MOUNT_TAG
    }

    fn ack_features(&mut self, features: u64) {
        self.acked_features = self.features() & features;
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let space = self.config_space();
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let len = data.len().min(space.len().saturating_sub(offset));
        if len > 0 {
            data[..len].copy_from_slice(&space[offset..offset + len]);
        }
        if len < data.len() {
            data[len..].fill(0);
        }
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {
        // The 9P config space is read-only.
    }

    fn activate(&mut self) -> Result<()> {
        self.status.set(DeviceStatus::DRIVER_OK);
        Ok(())
    }

    fn reset(&mut self) {
        self.acked_features = 0;
        self.interrupt_status = 0;
        self.pending.clear();
        self.status = DeviceStatus::new(0);
        self.failed.store(false, Ordering::SeqCst);
    }
}
