//! Waiting for the guest's SSH service to come up.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::CcvmError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kept below [`POLL_INTERVAL`] so a silent port cannot stretch the period.
const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// A single reachability check.
pub trait Probe: Sync {
    fn is_ready(&self) -> impl Future<Output = bool> + Send;
}

/// Considers the guest ready once the forwarded port answers with an SSH banner.
/// With user-mode networking QEMU accepts the TCP connection even while the
/// guest is still booting, so a bare connect proves nothing.
#[derive(Debug, Clone, Copy)]
pub struct SshProbe {
    addr: SocketAddr,
}

impl SshProbe {
    pub fn loopback(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }
}

impl Probe for SshProbe {
    async fn is_ready(&self) -> bool {
        let attempt = async {
            let mut stream = TcpStream::connect(self.addr).await.ok()?;
            let mut banner = [0u8; 4];
            stream.read_exact(&mut banner).await.ok()?;
            Some(&banner == b"SSH-")
        };
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, attempt).await,
            Ok(Some(true))
        )
    }
}

/// Probe every `interval` until ready. Never gives up on its own; only
/// `cancel` stops it. `on_wait` is called once per waiting period with the
/// number of periods already waited.
///
/// Ticks are fixed: a probe gets at most `interval` to answer, and a slow
/// probe delays the next tick instead of adding a full extra sleep.
pub async fn wait_until_ready<P, W>(
    probe: &P,
    cancel: &CancellationToken,
    interval: Duration,
    mut on_wait: W,
) -> Result<(), CcvmError>
where
    P: Probe,
    W: FnMut(u64) + Send,
{
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut waited = 0;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CcvmError::Cancelled),
            _ = ticks.tick() => {}
        }

        let ready = tokio::time::timeout(interval, probe.is_ready())
            .await
            .unwrap_or(false);
        if ready {
            tracing::debug!(waited, "guest ssh is reachable");
            return Ok(());
        }

        on_wait(waited);
        waited += 1;
    }
}
