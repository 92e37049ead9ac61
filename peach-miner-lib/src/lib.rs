pub mod miner;
pub mod peach;
pub mod settings;
pub mod stratum;
pub mod trailer;
pub mod trigg;

pub use miner::{Miner, MiningSettings};
pub use settings::ConfigSettings;
pub use stratum::{PoolJob, Share, ShareCounters};
pub use trailer::BlockTrailer;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use peach::TileCache;

pub struct Server {
    config: ConfigSettings,
    miner: std::sync::Mutex<Miner>,
    counters: Arc<ShareCounters>,
}

type ServerRef = Arc<Server>;

impl Server {
    pub fn from_config(config: ConfigSettings) -> eyre::Result<Self> {
        let mining_settings = MiningSettings {
            local_work_size: 256,
            kernel_name: config.kernel_name.clone(),
            gpu_indices: config.gpu_index_list(),
        };
        let miner = Miner::setup(mining_settings)?;
        Ok(Server {
            config,
            miner: std::sync::Mutex::new(miner),
            counters: Arc::new(ShareCounters::new()),
        })
    }

    pub async fn run(self: ServerRef) -> eyre::Result<()> {
        let (job_tx, job_rx) = watch::channel(None);
        let (diff_tx, diff_rx) = watch::channel(0u8);
        let (share_tx, share_rx) = mpsc::unbounded_channel();

        let t1 = tokio::spawn(stratum::run_client(
            self.config.pool_url.clone(),
            self.config.stratum_user(),
            self.config.pool_password.clone(),
            job_tx,
            diff_tx,
            share_rx,
            Arc::clone(&self.counters),
        ));
        let t2 = tokio::spawn({
            let server = Arc::clone(&self);
            mine_loop(server, job_rx, diff_rx, share_tx)
        });
        t1.await?;
        t2.await?;
        Ok(())
    }
}

/// Check a device solve against the CPU reference pipeline before letting it
/// near the pool, and drop it if the job moved on while it was in flight.
fn verify_solve(
    job: &PoolJob,
    mut bt: BlockTrailer,
    share_diff: u8,
) -> Option<Share> {
    if bt.phash() != job.trailer.phash() || bt.bnum() != job.trailer.bnum() {
        log::debug!("dropping stale solve for bnum {}", bt.bnum());
        return None;
    }
    let nonce = bt.nonce();
    let mut cache = TileCache::new(bt.phash());
    let hash = peach::compute(bt.prefix(), &nonce, &mut cache);
    let diff = bt.effective_difficulty(share_diff);
    if !peach::difficulty_ok(&hash, diff) {
        log::error!(
            "BUG: device solve failed CPU verification at diff {}. Contact the developers.",
            diff
        );
        return None;
    }
    bt.set_bhash(&hash);
    log::info!(
        "solve: bnum {} nonce {} hash {}",
        bt.bnum(),
        hex::encode(&nonce),
        hex::encode(&hash)
    );
    Some(Share {
        job_id: job.job_id.clone(),
        nonce,
        hash,
    })
}

async fn mine_loop(
    server: ServerRef,
    job_rx: watch::Receiver<Option<PoolJob>>,
    diff_rx: watch::Receiver<u8>,
    share_tx: mpsc::UnboundedSender<Share>,
) {
    let mut last_report = Instant::now();
    loop {
        let job = job_rx.borrow().clone();
        let share_diff = *diff_rx.borrow();
        let shares = tokio::task::spawn_blocking({
            let server = Arc::clone(&server);
            move || {
                let mut miner = server.miner.lock().unwrap();
                let solved = miner.poll(job.as_ref(), share_diff);
                drop(miner); // release before the tile-generating verification
                solved
                    .into_iter()
                    .filter_map(|bt| {
                        job.as_ref()
                            .and_then(|job| verify_solve(job, bt, share_diff))
                    })
                    .collect::<Vec<_>>()
            }
        })
        .await
        .unwrap_or_default();
        for share in shares {
            share_tx.send(share).ok();
        }

        if last_report.elapsed().as_secs() >= 10 {
            let hashrate = server.miner.lock().unwrap().hashrate();
            log::info!(
                "hashrate: {:.3} MH/s, shares: {} accepted / {} rejected",
                hashrate as f64 / 1_000_000.0,
                server.counters.accepted.load(Ordering::Acquire),
                server.counters.rejected.load(Ordering::Acquire)
            );
            last_report = Instant::now();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
