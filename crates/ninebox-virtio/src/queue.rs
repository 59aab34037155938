//! VirtIO queue (virtqueue) plumbing.
//!
//! The guest posts requests as chains of descriptors: device-readable
//! descriptors carry the 9P request frame, device-writable ones receive
//! the reply. Guest addresses are offsets into the RAM slice the caller
//! provides.

use crate::error::{Result, VirtioError};

/// Descriptor flags.
pub mod flags {
    /// Descriptor continues via the next field.
    pub const NEXT: u16 = 1;
    /// Buffer is write-only for the device.
    pub const WRITE: u16 = 2;
    /// Buffer contains a list of descriptors.
    pub const INDIRECT: u16 = 4;
}

/// A single descriptor in the descriptor table.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Descriptor {
    /// Guest address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index (if NEXT is set).
    pub next: u16,
}

impl Descriptor {
    /// Checks if this descriptor chains onward.
    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.flags & flags::NEXT != 0
    }

    /// Checks if this descriptor is write-only for the device.
    #[must_use]
    pub const fn is_write_only(&self) -> bool {
        self.flags & flags::WRITE != 0
    }
}

/// Used ring element.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UsedElement {
    /// Descriptor chain head index.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

/// One popped request chain: the request bytes and where the reply goes.
#[derive(Debug)]
pub struct ChainBuffers {
    /// Concatenated device-readable bytes.
    pub request: Vec<u8>,
    /// Device-writable segments as `(guest_addr, capacity)`.
    pub reply_slots: Vec<(u64, u32)>,
}

/// Host-side virtqueue state.
#[derive(Debug)]
pub struct VirtQueue {
    size: u16,
    desc_table: Vec<Descriptor>,
    avail: Vec<u16>,
    avail_idx: u16,
    last_avail_idx: u16,
    used: Vec<UsedElement>,
    used_idx: u16,
}

impl VirtQueue {
    /// Creates a queue of the given size (must be a power of two).
    ///
    /// # Errors
    ///
    /// Fails if `size` is zero or not a power of two.
    pub fn new(size: u16) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(VirtioError::InvalidQueue(format!(
                "size {size} is not a power of two"
            )));
        }
        Ok(Self {
            size,
            desc_table: vec![Descriptor::default(); size as usize],
            avail: vec![0; size as usize],
            avail_idx: 0,
            last_avail_idx: 0,
            used: vec![UsedElement::default(); size as usize],
            used_idx: 0,
        })
    }

    /// Queue size in descriptors.
    #[must_use]
    pub const fn size(&self) -> u16 {
        self.size
    }

    /// Installs a descriptor.
    ///
    /// # Errors
    ///
    /// Fails if `index` is out of range.
    pub fn set_descriptor(&mut self, index: u16, desc: Descriptor) -> Result<()> {
        if index >= self.size {
            return Err(VirtioError::InvalidDescriptor(format!(
                "index {index} out of range for queue of {}",
                self.size
            )));
        }
        self.desc_table[index as usize] = desc;
        Ok(())
    }

    /// Posts a chain head on the available ring (driver side).
    pub fn push_available(&mut self, head: u16) {
        let slot = (self.avail_idx % self.size) as usize;
        self.avail[slot] = head;
        self.avail_idx = self.avail_idx.wrapping_add(1);
    }

    /// Pops the next available chain head (device side).
    pub fn pop_available(&mut self) -> Option<u16> {
        if self.last_avail_idx == self.avail_idx {
            return None;
        }
        let slot = (self.last_avail_idx % self.size) as usize;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Some(self.avail[slot])
    }

    /// Publishes a completed chain on the used ring.
    pub fn push_used(&mut self, head: u16, len: u32) {
        let slot = (self.used_idx % self.size) as usize;
        self.used[slot] = UsedElement {
            id: u32::from(head),
            len,
        };
        self.used_idx = self.used_idx.wrapping_add(1);
    }

    /// Number of used-ring entries published so far.
    #[must_use]
    pub const fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// The most recently published used element.
    #[must_use]
    pub fn last_used(&self) -> Option<UsedElement> {
        if self.used_idx == 0 {
            return None;
        }
        let slot = (self.used_idx.wrapping_sub(1) % self.size) as usize;
        Some(self.used[slot])
    }

    /// Walks the chain starting at `head`, collecting request bytes from
    /// device-readable descriptors and reply slots from writable ones.
    ///
    /// # Errors
    ///
    /// Fails if a descriptor is out of range, points outside `ram`, or the
    /// chain is longer than the queue (a cycle).
    pub fn collect_chain(&self, ram: &[u8], head: u16) -> Result<ChainBuffers> {
        let mut request = Vec::new();
        let mut reply_slots = Vec::new();
        let mut index = head;

        for _ in 0..self.size {
            if index >= self.size {
                return Err(VirtioError::InvalidDescriptor(format!(
                    "chain index {index} out of range"
                )));
            }
            let desc = self.desc_table[index as usize];
            let start = usize::try_from(desc.addr).map_err(|_| {
                VirtioError::InvalidDescriptor(format!("address {:#x} unusable", desc.addr))
            })?;
            let end = start
                .checked_add(desc.len as usize)
                .filter(|&e| e <= ram.len())
                .ok_or_else(|| {
                    VirtioError::InvalidDescriptor(format!(
                        "buffer {:#x}+{} outside {} bytes of guest memory",
                        desc.addr,
                        desc.len,
                        ram.len()
                    ))
                })?;

            if desc.is_write_only() {
                reply_slots.push((desc.addr, desc.len));
            } else {
                request.extend_from_slice(&ram[start..end]);
            }

            if !desc.has_next() {
                return Ok(ChainBuffers {
                    request,
                    reply_slots,
                });
            }
            index = desc.next;
        }

        Err(VirtioError::InvalidDescriptor(
            "descriptor chain does not terminate".to_string(),
        ))
    }
}

/// Writes `frame` across the chain's writable segments, returning the byte
/// count written.
///
/// # Errors
///
/// Fails if the segments cannot hold the whole frame or point outside
/// `ram`.
pub fn write_into_slots(ram: &mut [u8], slots: &[(u64, u32)], frame: &[u8]) -> Result<usize> {
    let capacity: usize = slots.iter().map(|(_, len)| *len as usize).sum();
    if capacity < frame.len() {
        return Err(VirtioError::BufferTooSmall {
            needed: frame.len(),
            got: capacity,
        });
    }

    let mut written = 0;
    for (addr, len) in slots {
        if written == frame.len() {
            break;
        }
        let start = usize::try_from(*addr).map_err(|_| {
            VirtioError::InvalidDescriptor(format!("address {addr:#x} unusable"))
        })?;
        let chunk = (*len as usize).min(frame.len() - written);
        let end = start
            .checked_add(chunk)
            .filter(|&e| e <= ram.len())
            .ok_or_else(|| {
                VirtioError::InvalidDescriptor(format!(
                    "reply buffer {addr:#x}+{len} outside guest memory"
                ))
            })?;
        ram[start..end].copy_from_slice(&frame[written..written + chunk]);
        written += chunk;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_size_must_be_power_of_two() {
        assert!(VirtQueue::new(0).is_err());
        assert!(VirtQueue::new(100).is_err());
        assert!(VirtQueue::new(128).is_ok());
    }

    #[test]
    fn available_ring_is_fifo() {
        let mut q = VirtQueue::new(4).unwrap();
        q.push_available(2);
        q.push_available(0);
        assert_eq!(q.pop_available(), Some(2));
        assert_eq!(q.pop_available(), Some(0));
        assert_eq!(q.pop_available(), None);
    }

    #[test]
    fn collect_chain_splits_read_and_write_buffers() {
        let mut ram = vec![0u8; 256];
        ram[16..20].copy_from_slice(&[1, 2, 3, 4]);

        let mut q = VirtQueue::new(4).unwrap();
        q.set_descriptor(
            0,
            Descriptor {
                addr: 16,
                len: 4,
                flags: flags::NEXT,
                next: 1,
            },
        )
        .unwrap();
        q.set_descriptor(
            1,
            Descriptor {
                addr: 128,
                len: 64,
                flags: flags::WRITE,
                next: 0,
            },
        )
        .unwrap();

        let chain = q.collect_chain(&ram, 0).unwrap();
        assert_eq!(chain.request, vec![1, 2, 3, 4]);
        assert_eq!(chain.reply_slots, vec![(128, 64)]);
    }

    #[test]
    fn collect_chain_rejects_out_of_bounds_buffers() {
        let ram = vec![0u8; 32];
        let mut q = VirtQueue::new(4).unwrap();
        q.set_descriptor(
            0,
            Descriptor {
                addr: 24,
                len: 64,
                flags: 0,
                next: 0,
            },
        )
        .unwrap();
        assert!(q.collect_chain(&ram, 0).is_err());
    }

    #[test]
    fn collect_chain_detects_cycles() {
        let ram = vec![0u8; 32];
        let mut q = VirtQueue::new(4).unwrap();
        let looped = Descriptor {
            addr: 0,
            len: 1,
            flags: flags::NEXT,
            next: 0,
        };
        q.set_descriptor(0, looped).unwrap();
        assert!(q.collect_chain(&ram, 0).is_err());
    }

    #[test]
    fn write_into_slots_spans_segments() {
        let mut ram = vec![0u8; 64];
        let slots = [(0u64, 3u32), (10, 10)];
        let n = write_into_slots(&mut ram, &slots, b"abcdefgh").unwrap();
        assert_eq!(n, 8);
        assert_eq!(&ram[0..3], b"abc");
        assert_eq!(&ram[10..15], b"defgh");
    }

    #[test]
    fn write_into_slots_rejects_overflow() {
        let mut ram = vec![0u8; 64];
        let slots = [(0u64, 4u32)];
        let err = write_into_slots(&mut ram, &slots, b"too many bytes").unwrap_err();
        assert!(matches!(err, VirtioError::BufferTooSmall { .. }));
    }

    #[test]
    fn used_ring_records_completions() {
        let mut q = VirtQueue::new(4).unwrap();
        assert!(q.last_used().is_none());
        q.push_used(3, 11);
        assert_eq!(q.used_idx(), 1);
        let used = q.last_used().unwrap();
        assert_eq!(used.id, 3);
        assert_eq!(used.len, 11);
    }
}
