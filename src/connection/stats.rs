use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// General messages posted as SEND with immediate
    pub general_sends: u64,
    /// Control messages posted, credit updates included
    pub control_sends: u64,
    /// Large buffers announced to the peer
    pub large_sends: u64,
    /// RDMA READs posted to pull large buffers announced by the peer
    pub large_pulls: u64,
    pub direct_writes: u64,
    pub direct_reads: u64,
    /// General messages received into pre-posted buffers
    pub messages_received: u64,
    pub credit_updates_sent: u64,
    pub credit_updates_received: u64,
    /// Failed completions other than flushes
    pub failed_completions: u64,
    /// Requests flushed by a quiesced or disconnected queue pair
    pub flushed_completions: u64,
    pub protocol_errors: u64,
}

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(super) struct Counters {
            $(pub(super) $field: AtomicU64,)*
        }

        impl Counters {
            pub(super) fn snapshot(&self) -> ConnectionStats {
                ConnectionStats {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    general_sends,
    control_sends,
    large_sends,
    large_pulls,
    direct_writes,
    direct_reads,
    messages_received,
    credit_updates_sent,
    credit_updates_received,
    failed_completions,
    flushed_completions,
    protocol_errors,
);

pub(super) fn bump(counter: &AtomicU64) {
    let _prev = counter.fetch_add(1, Ordering::Relaxed);
}
