//! OpenCL device orchestration: one `GpuDevice` per GPU, each a small state
//! machine over two command queues that double-buffer cache builds and solve
//! launches. The host never blocks on the device outside of INIT re-entry and
//! shutdown; solve progress is polled through kernel completion events.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ocl::{
    builders::{DeviceSpecifier, ProgramBuilder},
    enums::{DeviceInfo, DeviceInfoResult},
    Buffer, Context, Device, Event, Kernel, Platform, Queue,
};
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::peach::{PEACHCACHELEN, PEACHTILELEN};
use crate::stratum::PoolJob;
use crate::trailer::{BlockTrailer, BTRAILER_LEN};
use crate::trigg;

/// Maximum block age before a job is considered stale, in seconds.
pub const BRIDGE_V3: u32 = 949;

/// Claim word plus eight nonce words.
const SOLVE_SLOT_WORDS: usize = 9;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("OpenCL error: {0:?}")]
    Ocl(ocl::Error),
    #[error("no OpenCL device at index {0}")]
    NoDevice(usize),
}

impl From<ocl::Error> for MinerError {
    fn from(err: ocl::Error) -> Self {
        MinerError::Ocl(err)
    }
}

use self::MinerError::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Null,
    Init,
    Idle,
    Work,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Allocated,
    CacheBuilt,
    JobReady,
    JobStale,
    PhashChanged,
    DeviceError,
}

/// The closed transition table; everything not listed keeps its state.
pub fn transition(state: DeviceState, event: DeviceEvent) -> DeviceState {
    use DeviceEvent::*;
    use DeviceState::*;
    match (state, event) {
        (_, DeviceError) => Fail,
        (Fail, _) => Fail,
        (Null, Allocated) => Init,
        (Init, CacheBuilt) => Idle,
        (Idle, JobReady) => Work,
        (Work, JobStale) => Idle,
        (Init, PhashChanged) | (Idle, PhashChanged) | (Work, PhashChanged) => Init,
        (state, _) => state,
    }
}

#[derive(Debug, Clone)]
pub struct MiningSettings {
    pub local_work_size: usize,
    pub kernel_name: String,
    pub gpu_indices: Vec<usize>,
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

pub struct GpuDevice {
    id: u32,
    name: String,
    queues: [Queue; 2],
    build_kernels: [Kernel; 2],
    solve_kernels: [Kernel; 2],
    map: Buffer<u8>,
    phash_buf: Buffer<u8>,
    bt_bufs: [Buffer<u8>; 2],
    prng_bufs: [Buffer<u64>; 2],
    solve_bufs: [Buffer<u32>; 2],
    events: [Option<Event>; 2],
    pending_bt: [BlockTrailer; 2],
    state: DeviceState,
    cur_phash: [u8; 32],
    solved_bnum: Option<u64>,
    build_progress: u32,
    build_started: Instant,
    work: u64,
    work_started: Instant,
    hps: u64,
    global_size: usize,
    local_size: usize,
    rng: StdRng,
}

impl GpuDevice {
    fn new(
        platform: Platform,
        device: Device,
        id: u32,
        settings: &MiningSettings,
    ) -> Result<Self, MinerError> {
        let name = device.name().map_err(Ocl)?;
        let ctx = Context::builder()
            .platform(platform.clone())
            .devices(DeviceSpecifier::Single(device.clone()))
            .build()
            .map_err(Ocl)?;
        let queues = [
            Queue::new(&ctx, device, None).map_err(Ocl)?,
            Queue::new(&ctx, device, None).map_err(Ocl)?,
        ];

        let local_size = settings.local_work_size.min(device.max_wg_size().map_err(Ocl)?);
        let compute_units = match device.info(DeviceInfo::MaxComputeUnits).map_err(Ocl)? {
            DeviceInfoResult::MaxComputeUnits(n) => n as usize,
            _ => 8,
        };
        let global_size = compute_units * 256 * local_size;

        let mut prog_builder = ProgramBuilder::new();
        prog_builder
            .src_file(format!("kernels/{}.cl", settings.kernel_name))
            .cmplr_def("WORKSIZE", local_size as i32)
            // dflops depends on strict fp32: correctly rounded division, no
            // relaxed math, no mad fusion
            .cmplr_opt("-cl-fp32-correctly-rounded-divide-sqrt")
            .devices(DeviceSpecifier::Single(device.clone()));
        let program = prog_builder.build(&ctx).map_err(Ocl)?;

        let map: Buffer<u8> = Buffer::builder()
            .queue(queues[0].clone())
            .len(PEACHCACHELEN as usize * PEACHTILELEN)
            .build()
            .map_err(Ocl)?;
        let phash_buf: Buffer<u8> = Buffer::builder()
            .queue(queues[0].clone())
            .len(32)
            .build()
            .map_err(Ocl)?;

        let mut bt_bufs = Vec::new();
        let mut prng_bufs = Vec::new();
        let mut solve_bufs = Vec::new();
        let mut build_kernels = Vec::new();
        let mut solve_kernels = Vec::new();
        for queue in queues.iter() {
            let bt: Buffer<u8> = Buffer::builder()
                .queue(queue.clone())
                .len(BTRAILER_LEN)
                .build()
                .map_err(Ocl)?;
            let prng: Buffer<u64> = Buffer::builder()
                .queue(queue.clone())
                .len(global_size)
                .build()
                .map_err(Ocl)?;
            let solve: Buffer<u32> = Buffer::builder()
                .queue(queue.clone())
                .len(SOLVE_SLOT_WORDS)
                .build()
                .map_err(Ocl)?;
            let build_kernel = Kernel::builder()
                .program(&program)
                .name("peach_build")
                .queue(queue.clone())
                .arg_named("map", Some(&map))
                .arg_named("phash", Some(&phash_buf))
                .arg_named("offset", 0u32)
                .build()
                .map_err(Ocl)?;
            let solve_kernel = Kernel::builder()
                .program(&program)
                .name("peach_solve")
                .queue(queue.clone())
                .arg_named("map", Some(&map))
                .arg_named("bt", Some(&bt))
                .arg_named("diff", 0u32)
                .arg_named("state", Some(&prng))
                .arg_named("solve", Some(&solve))
                .build()
                .map_err(Ocl)?;
            bt_bufs.push(bt);
            prng_bufs.push(prng);
            solve_bufs.push(solve);
            build_kernels.push(build_kernel);
            solve_kernels.push(solve_kernel);
        }

        Ok(GpuDevice {
            id,
            name,
            queues,
            build_kernels: [build_kernels.remove(0), build_kernels.remove(0)],
            solve_kernels: [solve_kernels.remove(0), solve_kernels.remove(0)],
            map,
            phash_buf,
            bt_bufs: [bt_bufs.remove(0), bt_bufs.remove(0)],
            prng_bufs: [prng_bufs.remove(0), prng_bufs.remove(0)],
            solve_bufs: [solve_bufs.remove(0), solve_bufs.remove(0)],
            events: [None, None],
            pending_bt: [BlockTrailer::default(); 2],
            state: DeviceState::Null,
            cur_phash: [0u8; 32],
            solved_bnum: None,
            build_progress: 0,
            build_started: Instant::now(),
            work: 0,
            work_started: Instant::now(),
            hps: 0,
            global_size,
            local_size,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn hashrate(&self) -> u64 {
        self.hps
    }

    pub fn map_len(&self) -> usize {
        self.map.len()
    }

    fn job_workable(&self, bt: &BlockTrailer) -> bool {
        bt.tcount() != 0
            && Some(bt.bnum()) != self.solved_bnum
            && (bt.time0() == 0 || now_secs().saturating_sub(bt.time0()) < BRIDGE_V3)
    }

    /// Re-enter INIT for a new phash: barrier on in-flight work, clear the
    /// solve slots, reseed the PRNG buffers and start rebuilding the map.
    fn begin_init(&mut self, phash: [u8; 32], event: DeviceEvent) -> Result<(), MinerError> {
        for slot in self.events.iter_mut() {
            *slot = None;
        }
        for queue in self.queues.iter() {
            queue.finish().map_err(Ocl)?;
        }
        self.state = transition(self.state, event);
        self.cur_phash = phash;
        self.phash_buf.write(&phash[..]).enq().map_err(Ocl)?;
        for (queue_id, (solve, prng)) in
            self.solve_bufs.iter().zip(self.prng_bufs.iter()).enumerate()
        {
            solve.write(&[0u32; SOLVE_SLOT_WORDS][..]).enq().map_err(Ocl)?;
            let seed = now_secs() as u64 ^ ((self.id as u64) << 32) ^ queue_id as u64;
            let mut states = vec![0u64; self.global_size];
            trigg::fill_prng_states(&mut states, seed);
            prng.write(&states).enq().map_err(Ocl)?;
        }
        self.build_progress = 0;
        self.build_started = Instant::now();
        self.work = 0;
        self.work_started = Instant::now();
        self.hps = 0;
        Ok(())
    }

    fn poll_init(&mut self) -> Result<(), MinerError> {
        for q in 0..2 {
            if let Some(ev) = &self.events[q] {
                if !ev.is_complete().map_err(|e| Ocl(e.into()))? {
                    continue;
                }
                self.events[q] = None;
            }
            if self.build_progress < PEACHCACHELEN {
                let chunk = (PEACHCACHELEN - self.build_progress).min(self.global_size as u32);
                let gws = round_up(chunk as usize, self.local_size);
                self.build_kernels[q]
                    .set_arg("offset", self.build_progress)
                    .map_err(Ocl)?;
                let mut ev = Event::empty();
                unsafe {
                    self.build_kernels[q]
                        .cmd()
                        .global_work_size(gws)
                        .local_work_size(self.local_size)
                        .enew(&mut ev)
                        .enq()
                        .map_err(Ocl)?;
                }
                self.events[q] = Some(ev);
                self.build_progress += chunk;
            }
        }
        if self.build_progress >= PEACHCACHELEN && self.events.iter().all(Option::is_none) {
            self.state = transition(self.state, DeviceEvent::CacheBuilt);
            log::info!(
                "gpu {} ({}): map built in {:.1}s",
                self.id,
                self.name,
                self.build_started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    fn poll_solve(
        &mut self,
        job: &PoolJob,
        share_diff: u8,
    ) -> Result<Option<BlockTrailer>, MinerError> {
        let diff = job.trailer.effective_difficulty(share_diff);
        for q in 0..2 {
            if let Some(ev) = &self.events[q] {
                if !ev.is_complete().map_err(|e| Ocl(e.into()))? {
                    continue;
                }
                self.events[q] = None;
                let mut slot = vec![0u32; SOLVE_SLOT_WORDS];
                self.solve_bufs[q].read(&mut slot).enq().map_err(Ocl)?;
                if slot[0] != 0 {
                    let mut nonce = [0u8; 32];
                    for (chunk, word) in nonce.chunks_exact_mut(4).zip(slot[1..].iter()) {
                        chunk.copy_from_slice(&word.to_le_bytes());
                    }
                    self.solve_bufs[q]
                        .write(&[0u32; SOLVE_SLOT_WORDS][..])
                        .enq()
                        .map_err(Ocl)?;
                    let mut solved = self.pending_bt[q];
                    solved.set_nonce(&nonce);
                    solved.set_stime(now_secs());
                    self.solved_bnum = Some(solved.bnum());
                    return Ok(Some(solved));
                }
            }
            let mut bt = job.trailer;
            bt.set_half_nonce(&trigg::trigg_generate(&mut self.rng));
            self.bt_bufs[q].write(&bt.as_bytes()[..]).enq().map_err(Ocl)?;
            self.solve_kernels[q]
                .set_arg("diff", diff as u32)
                .map_err(Ocl)?;
            let mut ev = Event::empty();
            unsafe {
                self.solve_kernels[q]
                    .cmd()
                    .global_work_size(self.global_size)
                    .local_work_size(self.local_size)
                    .enew(&mut ev)
                    .enq()
                    .map_err(Ocl)?;
            }
            self.events[q] = Some(ev);
            self.pending_bt[q] = bt;
            self.work += self.global_size as u64;
        }
        self.hps = self.work / self.work_started.elapsed().as_secs().max(1);
        Ok(None)
    }

    fn poll_inner(
        &mut self,
        job: Option<&PoolJob>,
        share_diff: u8,
    ) -> Result<Option<BlockTrailer>, MinerError> {
        match self.state {
            DeviceState::Fail => Ok(None),
            DeviceState::Null => {
                if let Some(job) = job {
                    self.begin_init(job.trailer.phash(), DeviceEvent::Allocated)?;
                }
                Ok(None)
            }
            DeviceState::Init => {
                self.poll_init()?;
                Ok(None)
            }
            DeviceState::Idle => {
                if let Some(job) = job {
                    if job.trailer.phash() != self.cur_phash {
                        self.begin_init(job.trailer.phash(), DeviceEvent::PhashChanged)?;
                    } else if self.job_workable(&job.trailer) {
                        self.state = transition(self.state, DeviceEvent::JobReady);
                        self.work = 0;
                        self.work_started = Instant::now();
                        log::debug!("gpu {}: mining bnum {}", self.id, job.trailer.bnum());
                    }
                }
                Ok(None)
            }
            DeviceState::Work => {
                let job = match job {
                    Some(job) => job,
                    None => {
                        self.state = transition(self.state, DeviceEvent::JobStale);
                        return Ok(None);
                    }
                };
                if job.trailer.phash() != self.cur_phash {
                    self.begin_init(job.trailer.phash(), DeviceEvent::PhashChanged)?;
                    return Ok(None);
                }
                if !self.job_workable(&job.trailer) {
                    self.state = transition(self.state, DeviceEvent::JobStale);
                    return Ok(None);
                }
                self.poll_solve(job, share_diff)
            }
        }
    }

    /// Advance the device one cooperative step. Errors latch the FAIL state;
    /// the device is skipped from then on.
    pub fn poll(
        &mut self,
        job: Option<&PoolJob>,
        share_diff: u8,
    ) -> Result<Option<BlockTrailer>, MinerError> {
        let result = self.poll_inner(job, share_diff);
        if result.is_err() {
            self.state = transition(self.state, DeviceEvent::DeviceError);
        }
        result
    }
}

pub struct Miner {
    devices: Vec<GpuDevice>,
}

impl Miner {
    pub fn setup(settings: MiningSettings) -> eyre::Result<Self> {
        let mut all = Vec::new();
        for platform in Platform::list() {
            if let Ok(devices) = Device::list_all(&platform) {
                for device in devices {
                    all.push((platform.clone(), device));
                }
            }
        }
        let mut devices = Vec::new();
        for (slot, &index) in settings.gpu_indices.iter().enumerate() {
            let (platform, device) = all.get(index).cloned().ok_or(NoDevice(index))?;
            match GpuDevice::new(platform, device, slot as u32, &settings) {
                Ok(dev) => {
                    log::info!(
                        "gpu {}: {} ({} work items per launch, {} MiB map)",
                        slot,
                        dev.name(),
                        dev.global_size,
                        dev.map_len() >> 20
                    );
                    devices.push(dev);
                }
                Err(err) => log::error!("gpu index {} failed to initialize: {}", index, err),
            }
        }
        if devices.is_empty() {
            eyre::bail!("no usable OpenCL device");
        }
        Ok(Miner { devices })
    }

    pub fn list_device_names() -> Vec<String> {
        let mut names = Vec::new();
        for platform in Platform::list() {
            let platform_name = platform
                .name()
                .unwrap_or_else(|_| "<invalid platform>".to_string());
            for device in Device::list_all(&platform).unwrap_or_default() {
                names.push(format!(
                    "{} - {}",
                    platform_name,
                    device.name().unwrap_or_else(|_| "<invalid device>".to_string())
                ));
            }
        }
        names
    }

    /// Poll every device; returns any solved trailers.
    pub fn poll(&mut self, job: Option<&PoolJob>, share_diff: u8) -> Vec<BlockTrailer> {
        let mut solved = Vec::new();
        for dev in self.devices.iter_mut() {
            match dev.poll(job, share_diff) {
                Ok(Some(bt)) => solved.push(bt),
                Ok(None) => {}
                Err(err) => log::error!("gpu {} ({}) failed: {}", dev.id, dev.name, err),
            }
        }
        solved
    }

    pub fn hashrate(&self) -> u64 {
        self.devices.iter().map(GpuDevice::hashrate).sum()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
