//! Scheduler
//!
//! Multi-core dispatch over a FIFO ready queue of process names: one
//! worker thread per emulated core, an admission path that parks
//! processes in a retry queue while memory is tight, a background
//! generator that synthesizes workload, and the retry thread that
//! re-attempts the admission queue head.
//!
//! The process table owns every PCB; queues, the finished list and the
//! dispatch trace refer to processes by name. Queue state lives under a
//! short-held spinlock, while each PCB has its own blocking mutex that a
//! worker holds for the whole execution slice (slices sleep, spinning on
//! them would burn a core).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as BlockingMutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use spin::Mutex as SpinMutex;

use osim_mm::{MemoryManager, MemoryStats};

use crate::config::{Config, SchedulerPolicy};
use crate::instruction::Instruction;
use crate::process::interp::{self, StepOutcome};
use crate::process::pcb::Pcb;
use crate::stats::{ProcessSnapshot, SchedulerStats};
use crate::PACING;

/// Cadence of the admission-retry thread.
const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Length bounds for user-supplied programs.
const MAX_PROGRAM_LEN: usize = 50;

/// Dispatches recorded before the trace stops growing.
const DISPATCH_TRACE_LIMIT: usize = 4096;

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    DuplicateName(String),
    /// Supplied program length outside `1..=50`.
    ProgramLength(usize),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::DuplicateName(name) => {
                write!(f, "a process named {:?} already exists", name)
            }
            AdmissionError::ProgramLength(len) => {
                write!(f, "program length {} outside 1..={}", len, MAX_PROGRAM_LEN)
            }
        }
    }
}

impl std::error::Error for AdmissionError {}

/// One process-table slot. The busy flag asserts that no two workers
/// ever hold the same process at once.
struct ProcessSlot {
    busy: AtomicBool,
    pcb: BlockingMutex<Pcb>,
}

impl ProcessSlot {
    fn new(pcb: Pcb) -> Arc<Self> {
        Arc::new(ProcessSlot {
            busy: AtomicBool::new(false),
            pcb: BlockingMutex::new(pcb),
        })
    }
}

/// Queue and table state under the scheduler lock.
struct SchedInner {
    table: HashMap<String, Arc<ProcessSlot>>,
    ready: VecDeque<String>,
    finished: Vec<String>,
    retry: VecDeque<String>,
    retry_sizes: HashMap<String, usize>,
    dispatch_trace: Vec<String>,
}

/// State shared with the worker, generator, and retry threads.
struct SchedState {
    config: Config,
    mm: Arc<MemoryManager>,
    inner: SpinMutex<SchedInner>,
    running: AtomicBool,
    accepting: AtomicBool,
    cpu_tick: AtomicU64,
    active_cores: AtomicUsize,
}

/// Multi-core scheduler. Owns the process table, the memory manager
/// handle, and every background thread.
pub struct Scheduler {
    state: Arc<SchedState>,
    workers: Vec<JoinHandle<()>>,
    generator: Option<JoinHandle<()>>,
    retry_thread: Option<JoinHandle<()>>,
    rng: SmallRng,
}

impl Scheduler {
    /// Build a scheduler and a fresh memory manager from `config`. The
    /// config must have passed [`Config::validate`].
    pub fn new(config: Config) -> Self {
        let mm = Arc::new(MemoryManager::new(
            config.max_overall_mem,
            config.mem_per_frame,
        ));
        Self::with_memory(config, mm)
    }

    /// Build over an existing memory manager, e.g. one with a private
    /// backing-store path.
    pub fn with_memory(config: Config, mm: Arc<MemoryManager>) -> Self {
        Scheduler {
            state: Arc::new(SchedState {
                config,
                mm,
                inner: SpinMutex::new(SchedInner {
                    table: HashMap::new(),
                    ready: VecDeque::new(),
                    finished: Vec::new(),
                    retry: VecDeque::new(),
                    retry_sizes: HashMap::new(),
                    dispatch_trace: Vec::new(),
                }),
                running: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                cpu_tick: AtomicU64::new(0),
                active_cores: AtomicUsize::new(0),
            }),
            workers: Vec::new(),
            generator: None,
            retry_thread: None,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Shared handle to the paging layer.
    pub fn memory(&self) -> Arc<MemoryManager> {
        Arc::clone(&self.state.mm)
    }

    /// Spawn the worker pool, the admission-retry thread, and the
    /// workload generator.
    pub fn start(&mut self) {
        self.start_workers();
        self.start_generator();
    }

    /// Stop the worker pool and the retry thread. In-flight slices run
    /// to their natural end; idempotent.
    pub fn stop(&mut self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.retry_thread.take() {
            let _ = handle.join();
        }
    }

    /// Stop synthesizing workload; workers keep running.
    pub fn stop_process_generation(&mut self) {
        self.state.accepting.store(false, Ordering::SeqCst);
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Create a process with a generated program and a random virtual
    /// size drawn from the configured range, then attempt admission.
    pub fn create_named_process(&mut self, name: &str) -> Result<(), AdmissionError> {
        let config = &self.state.config;
        let count = self.rng.gen_range(config.min_ins..=config.max_ins);
        let mem_size = self
            .rng
            .gen_range(config.min_mem_per_proc..=config.max_mem_per_proc);
        let mut pcb = Pcb::new(name);
        pcb.generate_program(count, mem_size, &mut self.rng);
        admit(&self.state, pcb, mem_size)
    }

    /// Create a process with a supplied program (1..=50 instructions)
    /// and a random virtual size, then attempt admission.
    pub fn create_named_process_with_instructions(
        &mut self,
        name: &str,
        program: Vec<Instruction>,
    ) -> Result<(), AdmissionError> {
        if program.is_empty() || program.len() > MAX_PROGRAM_LEN {
            return Err(AdmissionError::ProgramLength(program.len()));
        }
        let config = &self.state.config;
        let mem_size = self
            .rng
            .gen_range(config.min_mem_per_proc..=config.max_mem_per_proc);
        let mut pcb = Pcb::new(name);
        for instruction in program {
            pcb.add_instruction(instruction);
        }
        admit(&self.state, pcb, mem_size)
    }

    /// Create a process with an explicit virtual size, bypassing the
    /// admission gate: the size may exceed physical memory and demand
    /// paging absorbs the difference. Mirrors the console's sized
    /// submission path.
    pub fn create_process_with_memory(
        &mut self,
        name: &str,
        mem_size: usize,
        program: Vec<Instruction>,
    ) -> Result<(), AdmissionError> {
        if program.is_empty() || program.len() > MAX_PROGRAM_LEN {
            return Err(AdmissionError::ProgramLength(program.len()));
        }
        let mut pcb = Pcb::new(name);
        for instruction in program {
            pcb.add_instruction(instruction);
        }
        pcb.allocated_bytes = mem_size;

        let state = &self.state;
        let mut inner = state.inner.lock();
        if inner.table.contains_key(name) {
            return Err(AdmissionError::DuplicateName(name.to_string()));
        }
        state.mm.allocate(name, mem_size);
        inner.table.insert(name.to_string(), ProcessSlot::new(pcb));
        inner.ready.push_back(name.to_string());
        log::info!("loaded process {} ({} B, ungated)", name, mem_size);
        Ok(())
    }

    /// Run `f` against the PCB of `name`, if it exists. The process
    /// stays inspectable after it finishes.
    pub fn inspect<R>(&self, name: &str, f: impl FnOnce(&Pcb) -> R) -> Option<R> {
        let slot = {
            let inner = self.state.inner.lock();
            inner.table.get(name).cloned()
        };
        slot.map(|slot| f(&lock_pcb(&slot.pcb)))
    }

    /// Every process not yet finished, admission order not guaranteed.
    pub fn running_processes(&self) -> Vec<ProcessSnapshot> {
        self.collect_snapshots(|snapshot| !snapshot.finished)
    }

    /// Finished processes in completion order.
    pub fn finished_processes(&self) -> Vec<ProcessSnapshot> {
        let (names, table) = {
            let inner = self.state.inner.lock();
            (inner.finished.clone(), inner.table.clone())
        };
        names
            .iter()
            .filter_map(|name| table.get(name).map(|slot| snapshot_slot(name, slot)))
            .collect()
    }

    /// Distinct cores named by unfinished processes; the utilization
    /// report's "cores in use".
    pub fn cores_in_use(&self) -> usize {
        let mut cores: Vec<i32> = self
            .running_processes()
            .into_iter()
            .filter(|snapshot| snapshot.core >= 0)
            .map(|snapshot| snapshot.core)
            .collect();
        cores.sort_unstable();
        cores.dedup();
        cores.len()
    }

    /// Names in ready-queue pop order, oldest first.
    pub fn dispatch_trace(&self) -> Vec<String> {
        self.state.inner.lock().dispatch_trace.clone()
    }

    /// Current ready-queue contents, front first.
    pub fn ready_queue(&self) -> Vec<String> {
        self.state.inner.lock().ready.iter().cloned().collect()
    }

    /// Current admission-retry queue contents, head first.
    pub fn retry_queue(&self) -> Vec<String> {
        self.state.inner.lock().retry.iter().cloned().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let cpu_tick = self.state.cpu_tick.load(Ordering::SeqCst);
        let active = self.state.active_cores.load(Ordering::SeqCst) as u64;
        let active_ticks = cpu_tick * active;
        SchedulerStats {
            cpu_tick,
            active_ticks,
            idle_ticks: cpu_tick * self.state.config.num_cpu as u64 - active_ticks,
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.state.mm.stats()
    }

    fn start_workers(&mut self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for core in 0..self.state.config.num_cpu {
            let state = Arc::clone(&self.state);
            self.workers
                .push(thread::spawn(move || worker_loop(state, core)));
        }
        let state = Arc::clone(&self.state);
        self.retry_thread = Some(thread::spawn(move || retry_loop(state)));
    }

    fn start_generator(&mut self) {
        if self.state.accepting.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        self.generator = Some(thread::spawn(move || generator_loop(state)));
    }

    fn collect_snapshots(&self, keep: impl Fn(&ProcessSnapshot) -> bool) -> Vec<ProcessSnapshot> {
        let slots: Vec<(String, Arc<ProcessSlot>)> = {
            let inner = self.state.inner.lock();
            inner
                .table
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect()
        };
        slots
            .iter()
            .map(|(name, slot)| snapshot_slot(name, slot))
            .filter(|snapshot| keep(snapshot))
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_process_generation();
        self.stop();
    }
}

/// Admission path shared by the gated creation calls and the generator:
/// fit in memory now, or wait in the retry queue.
fn admit(state: &SchedState, mut pcb: Pcb, mem_size: usize) -> Result<(), AdmissionError> {
    let name = pcb.name.clone();
    pcb.allocated_bytes = mem_size;

    let mut inner = state.inner.lock();
    if inner.table.contains_key(&name) {
        return Err(AdmissionError::DuplicateName(name));
    }
    if state.mm.used_bytes() + mem_size <= state.config.max_overall_mem {
        state.mm.allocate(&name, mem_size);
        inner.table.insert(name.clone(), ProcessSlot::new(pcb));
        inner.ready.push_back(name.clone());
        log::info!("loaded process {} ({} B)", name, mem_size);
    } else {
        inner.table.insert(name.clone(), ProcessSlot::new(pcb));
        inner.retry.push_back(name.clone());
        inner.retry_sizes.insert(name.clone(), mem_size);
        log::info!("insufficient memory for {}, queued for retry", name);
    }
    Ok(())
}

fn worker_loop(state: Arc<SchedState>, core: usize) {
    while state.running.load(Ordering::SeqCst) {
        let job = {
            let mut inner = state.inner.lock();
            match inner.ready.pop_front() {
                Some(name) => {
                    if inner.dispatch_trace.len() < DISPATCH_TRACE_LIMIT {
                        inner.dispatch_trace.push(name.clone());
                    }
                    inner.table.get(&name).cloned().map(|slot| (name, slot))
                }
                None => None,
            }
        };

        if let Some((name, slot)) = job {
            state.active_cores.fetch_add(1, Ordering::SeqCst);
            run_slice(&state, &name, &slot, core);
            state.active_cores.fetch_sub(1, Ordering::SeqCst);
        }

        thread::sleep(PACING * state.config.delay_per_exec as u32);
        state.cpu_tick.fetch_add(1, Ordering::SeqCst);
    }
}

/// Run one scheduling slice of the named process and requeue or retire
/// it. Nothing may escape a worker, so an unexpected panic inside the
/// interpreter is logged against the process and retires it too.
fn run_slice(state: &SchedState, name: &str, slot: &ProcessSlot, core: usize) {
    let was_busy = slot.busy.swap(true, Ordering::SeqCst);
    debug_assert!(!was_busy, "process {} dispatched to two cores", name);

    let mut pcb = lock_pcb(&slot.pcb);
    if panic::catch_unwind(AssertUnwindSafe(|| execute_slice(state, &mut pcb, core))).is_err() {
        pcb.log("[error] worker caught an unexpected panic; terminating process");
        pcb.is_finished = true;
    }
    let finished = pcb.is_finished;
    drop(pcb);
    slot.busy.store(false, Ordering::SeqCst);

    let mut inner = state.inner.lock();
    if finished {
        state.mm.free(name);
        inner.finished.push(name.to_string());
        log::info!("process {} finished", name);
    } else {
        inner.ready.push_back(name.to_string());
    }
}

fn execute_slice(state: &SchedState, pcb: &mut Pcb, core: usize) {
    match state.config.scheduler {
        SchedulerPolicy::Rr => {
            let mut executed = 0;
            while !pcb.is_finished && executed < state.config.quantum_cycles {
                match interp::step_once(pcb, core, &state.mm) {
                    StepOutcome::Advanced => executed += 1,
                    // A serviced fault re-attempts the same instruction
                    // without burning quantum.
                    StepOutcome::Retry => {}
                    StepOutcome::Terminated => break,
                }
            }
        }
        SchedulerPolicy::Fcfs => {
            while !pcb.is_finished {
                let _ = interp::step_once(pcb, core, &state.mm);
            }
        }
    }
}

/// Synthesize `p000, p001, ...` every `batch_freq` pacing units. The
/// sleep happens in pacing-sized slices so shutdown stays responsive.
fn generator_loop(state: Arc<SchedState>) {
    let mut rng = SmallRng::from_entropy();
    let mut next_id = 0usize;
    'outer: while state.accepting.load(Ordering::SeqCst) {
        for _ in 0..state.config.batch_freq {
            if !state.accepting.load(Ordering::SeqCst) {
                break 'outer;
            }
            thread::sleep(PACING);
        }
        if !state.accepting.load(Ordering::SeqCst) {
            break;
        }

        let name = format!("p{:03}", next_id);
        next_id += 1;
        let count = rng.gen_range(state.config.min_ins..=state.config.max_ins);
        let mem_size = rng.gen_range(state.config.min_mem_per_proc..=state.config.max_mem_per_proc);
        let mut pcb = Pcb::new(&name);
        pcb.generate_program(count, mem_size, &mut rng);
        if let Err(err) = admit(&state, pcb, mem_size) {
            log::warn!("generator skipped {}: {}", name, err);
        }
    }
}

/// Re-attempt the admission-queue head whenever memory frees up. Head of
/// line only: a large process at the front intentionally blocks smaller
/// ones behind it.
fn retry_loop(state: Arc<SchedState>) {
    while state.running.load(Ordering::SeqCst) {
        thread::sleep(RETRY_PERIOD);
        let mut inner = state.inner.lock();
        let Some(head) = inner.retry.front().cloned() else {
            continue;
        };
        let size = inner.retry_sizes.get(&head).copied().unwrap_or(0);
        if state.mm.used_bytes() + size <= state.config.max_overall_mem {
            inner.retry.pop_front();
            inner.retry_sizes.remove(&head);
            state.mm.allocate(&head, size);
            inner.ready.push_back(head.clone());
            log::info!("retried and loaded {}", head);
        }
    }
}

fn snapshot_slot(name: &str, slot: &ProcessSlot) -> ProcessSnapshot {
    let pcb = lock_pcb(&slot.pcb);
    ProcessSnapshot {
        name: name.to_string(),
        start_time: pcb.start_time().to_string(),
        core: pcb.last_executed_core,
        instruction_pointer: pcb.instruction_pointer,
        total_instructions: pcb.total_instructions(),
        finished: pcb.is_finished,
    }
}

// A poisoned PCB lock means a worker panicked outside the interpreter;
// the record itself is still usable for inspection and retirement.
fn lock_pcb(mutex: &BlockingMutex<Pcb>) -> MutexGuard<'_, Pcb> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
