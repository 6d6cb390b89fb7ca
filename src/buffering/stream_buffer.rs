use super::manager::{BufferingManager, QueueEvent, QueueId};
use crate::codec::{PacketSink, StreamConfig};
use crate::pool::{PacketPool, PesPacket};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of polling a [`StreamBuffer`].
#[derive(Debug)]
pub enum NextPacket {
    Packet(PesPacket),
    /// Nothing to hand out yet: the queue is empty or the manager is
    /// still buffering.
    Pending,
    /// The stream ended and every packet was taken.
    EndOfStream,
}

#[derive(Debug, Default)]
struct BufferState {
    packets: VecDeque<PesPacket>,
    done: bool,
    config: Option<StreamConfig>,
}

/// FIFO of finished packets for one elementary stream.
///
/// The demuxer side enqueues through [`PacketSink`] (implemented for
/// `Arc<StreamBuffer>`); the consumer polls [`StreamBuffer::next_packet`]
/// and frees each packet back to the pool when done with it.
pub struct StreamBuffer {
    id: QueueId,
    manager: Arc<BufferingManager>,
    pool: PacketPool,
    state: Mutex<BufferState>,
}

impl StreamBuffer {
    pub fn new(manager: Arc<BufferingManager>, pool: PacketPool) -> Arc<Self> {
        let id = manager.create_queue();
        Arc::new(Self {
            id,
            manager,
            pool,
            state: Mutex::new(BufferState::default()),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn enqueue(&self, packet: PesPacket) {
        let timestamp = packet.timestamp();
        let bytes = packet.len();
        let notify = {
            let mut state = self.state.lock();
            if state.done {
                drop(state);
                self.pool.free(packet);
                return;
            }
            state.packets.push_back(packet);
            self.manager.record(self.id, QueueEvent::Enqueue { timestamp, bytes })
        };
        if notify {
            self.manager.notify();
        }
    }

    /// Takes the next packet unless the manager is holding playback back
    /// to buffer.
    pub fn next_packet(&self) -> NextPacket {
        let (next, notify) = {
            let mut state = self.state.lock();
            if self.manager.is_buffering() && !state.done {
                return NextPacket::Pending;
            }

            match state.packets.pop_front() {
                Some(packet) => {
                    let head = state.packets.iter().find_map(|p| p.timestamp());
                    let bytes = packet.len();
                    let notify = self.manager.record(self.id, QueueEvent::Dequeue { head, bytes });
                    (NextPacket::Packet(packet), notify)
                }
                None if state.done => return NextPacket::EndOfStream,
                None => (NextPacket::Pending, self.manager.record(self.id, QueueEvent::Exhausted)),
            }
        };
        if notify {
            self.manager.notify();
        }
        next
    }

    /// Drops every queued packet back to the pool (seek).
    pub fn flush(&self) {
        let (dropped, notify) = {
            let mut state = self.state.lock();
            state.done = false;
            let dropped: Vec<PesPacket> = state.packets.drain(..).collect();
            (dropped, self.manager.record(self.id, QueueEvent::Flush))
        };
        for packet in dropped {
            self.pool.free(packet);
        }
        if notify {
            self.manager.notify();
        }
    }

    pub fn end_of_stream(&self) {
        let notify = {
            let mut state = self.state.lock();
            state.done = true;
            self.manager.record(self.id, QueueEvent::Done)
        };
        if notify {
            self.manager.notify();
        }
    }

    /// Configuration reported by the stream's handler, once known.
    pub fn configuration(&self) -> Option<StreamConfig> {
        self.state.lock().config.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for packet in state.packets.drain(..) {
            self.pool.free(packet);
        }
        self.manager.release_queue(self.id);
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamBuffer")
            .field("id", &self.id)
            .field("packets", &state.packets.len())
            .field("done", &state.done)
            .finish()
    }
}

impl PacketSink for Arc<StreamBuffer> {
    fn configure(&mut self, config: StreamConfig) {
        let mut state = self.state.lock();
        if state.config.is_none() {
            state.config = Some(config);
        }
    }

    fn submit(&mut self, packet: PesPacket) {
        self.enqueue(packet);
    }

    fn end_of_stream(&mut self) {
        StreamBuffer::end_of_stream(self);
    }
}
