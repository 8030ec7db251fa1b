//! Per-connection verbs resources.
//!
//! Everything a connected queue pair needs (protection domain, completion
//! channel, completion queue, and the queue pair itself) is acquired as
//! one bundle from a resolved connection-manager identifier. Acquisition
//! is step-by-step with `?`, so a failure at any point releases exactly
//! the resources already acquired; teardown order is fixed by field
//! declaration order.

use crate::config::ConnConfig;
use sideway::ibverbs::completion::{CompletionChannel, GenericCompletionQueue};
use sideway::ibverbs::device_context::DeviceContext;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::queue_pair::{
    GenericQueuePair, QueuePair, QueuePairState, QueuePairType,
};
use sideway::rdmacm::communication_manager::Identifier;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

/// Convert any displayable error into `io::Error`.
pub(crate) trait IntoIoError<T> {
    fn io_err(self) -> io::Result<T>;
}

impl<T, E: std::fmt::Display> IntoIoError<T> for Result<T, E> {
    fn io_err(self) -> io::Result<T> {
        self.map_err(|e| io::Error::other(e.to_string()))
    }
}

/// The native resources behind one connection.
pub(crate) struct Verbs {
    // Drop order is teardown order: the queue pair goes first, then the
    // completion queue it feeds, then the channel, then the protection
    // domain and device context.
    pub qp: GenericQueuePair,
    pub cq: GenericCompletionQueue,
    pub channel: Arc<CompletionChannel>,
    pub pd: Arc<ProtectionDomain>,
    #[allow(dead_code)]
    pub ctx: Arc<DeviceContext>,
}

impl Verbs {
    /// Acquire the full bundle for a resolved identifier and move the
    /// queue pair to Init. The completion queue gets `2 * depth` entries:
    /// sends and receives share it.
    pub fn build(id: &Arc<Identifier>, config: &ConnConfig) -> io::Result<Self> {
        let depth = u32::from(config.queue_depth);

        let ctx = id
            .get_device_context()
            .ok_or_else(|| io::Error::other("identifier has no device context"))?;

        let pd = ctx.alloc_pd().io_err()?;

        let channel = CompletionChannel::new(&ctx).io_err()?;
        channel.set_nonblocking(true)?;

        let cq: GenericCompletionQueue = ctx
            .create_cq_builder()
            .setup_cqe(depth * 2)
            .setup_comp_channel(&channel, 0)
            .build()
            .io_err()?
            .into();

        let mut builder = pd.create_qp_builder();
        builder.setup_send_cq(cq.clone());
        builder.setup_recv_cq(cq.clone());
        builder.setup_qp_type(QueuePairType::ReliableConnection);
        builder
            .setup_max_send_wr(depth)
            .setup_max_send_sge(1)
            .setup_max_recv_wr(depth)
            .setup_max_recv_sge(1);
        let qp = GenericQueuePair::Basic(builder.build().io_err()?);

        let mut verbs = Self {
            qp,
            cq,
            channel,
            pd,
            ctx,
        };
        verbs.transition(id, QueuePairState::Init)?;
        verbs.rearm()?;
        Ok(verbs)
    }

    /// Move the queue pair to `state` using CM-derived attributes.
    pub fn transition(&mut self, id: &Arc<Identifier>, state: QueuePairState) -> io::Result<()> {
        let attr = id.get_qp_attr(state).io_err()?;
        self.qp.modify(&attr).io_err()
    }

    /// Move the queue pair through Ready-to-Receive and Ready-to-Send.
    pub fn to_ready(&mut self, id: &Arc<Identifier>) -> io::Result<()> {
        self.transition(id, QueuePairState::ReadyToReceive)?;
        self.transition(id, QueuePairState::ReadyToSend)
    }

    /// Request a completion-channel notification for the next CQ entry.
    pub fn rearm(&self) -> io::Result<()> {
        self.cq.req_notify(false).io_err()
    }

    /// Absorb one completion-channel event and re-request notification.
    /// An event may arrive without a matching CQ entry; callers poll the
    /// queue regardless.
    pub fn absorb_cq_event(&self) -> io::Result<()> {
        self.channel.get_cq_event().io_err()?;
        self.rearm()
    }

    /// The completion channel fd, for the notifier.
    pub fn comp_fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }
}
