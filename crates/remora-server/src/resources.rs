//! Per-connection transport resources.
//!
//! Everything a connection needs, allocated in rendezvous order and owned
//! by one struct so teardown can walk it deterministically: protection
//! domain (with the shared segment), completion channel, completion
//! queue, queue pair. One completion queue serves both directions, as the
//! handshake never has more than one request in flight per side.

use std::sync::Arc;

use remora_fabric::{
    CmId, CompChannel, CompletionQueue, ProtectionDomain, QpInitAttr, QueuePair, SegmentConfig,
};

use crate::config::ServerConfig;
use crate::error::ServerError;

pub struct ConnectionResources {
    pub id: Arc<CmId>,
    pub pd: ProtectionDomain,
    pub channel: Arc<CompChannel>,
    pub cq: Arc<CompletionQueue>,
    pub qp: Arc<QueuePair>,
}

impl ConnectionResources {
    /// Allocate the full resource set for a pending connection. The
    /// completion queue comes back armed.
    pub fn allocate(id: Arc<CmId>, config: &ServerConfig) -> Result<Self, ServerError> {
        let segment_path = config.segment_dir.join(format!(
            "remora-{}-{}.seg",
            std::process::id(),
            id.conn_id().0
        ));
        let pd = id.alloc_pd(
            &segment_path,
            SegmentConfig {
                data_capacity: config.segment_capacity,
            },
        )?;

        let channel = CompChannel::new()?;
        let cq = CompletionQueue::new(config.cq_capacity, channel.clone());
        cq.req_notify();

        let qp = id.create_qp(QpInitAttr {
            max_send_wr: config.max_wr,
            max_recv_wr: config.max_wr,
            max_sge: config.max_sge,
            send_cq: cq.clone(),
            recv_cq: cq.clone(),
        })?;

        tracing::debug!(
            conn = %id.conn_id(),
            qp = qp.qp_num(),
            segment = %segment_path.display(),
            "allocated connection resources"
        );

        Ok(Self {
            id,
            pd,
            channel,
            cq,
            qp,
        })
    }
}
