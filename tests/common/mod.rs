//! Simulated host for integration tests.
//!
//! Each "processor" is a std thread spawned when an NMI is sent to it.
//! Memory is a set of mapped 4KB pages; any read outside them panics the
//! handler thread, which fails the sweep at deregistration.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, Once};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use nmi_sweep::address::{PAGE_MASK, PAGE_SIZE};
use nmi_sweep::affinity::AffinityMask;
use nmi_sweep::capture::CaptureBlock;
use nmi_sweep::host::{MachineFrame, MemoryProbe, NmiDispatch, NmiTrap, ProcessorControl};
use nmi_sweep::modules::{ModuleDirectory, ModuleRing, RingIter};

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Run `f` as if on processor `cpu`.
pub fn on_cpu<R>(cpu: usize, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_CPU.with(|c| c.replace(cpu));
    let out = f();
    CURRENT_CPU.with(|c| c.set(prev));
    out
}

// =============================================================================
// Log Capture
// =============================================================================

thread_local! {
    static RECORDS: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Logger that keeps each thread's records apart, so parallel tests do not
/// see each other's output.
struct ThreadLogger;

impl log::Log for ThreadLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        RECORDS.with(|r| {
            r.borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static LOGGER: ThreadLogger = ThreadLogger;
static LOGGER_INIT: Once = Once::new();

/// Run `f` and return its result with every record it logged on this thread.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, Vec<(log::Level, String)>) {
    LOGGER_INIT.call_once(|| {
        log::set_logger(&LOGGER).expect("logger already installed");
        log::set_max_level(log::LevelFilter::Trace);
    });
    RECORDS.with(|r| r.borrow_mut().clear());
    let out = f();
    let records = RECORDS.with(|r| r.borrow_mut().drain(..).collect());
    (out, records)
}

// =============================================================================
// Simulated Processors
// =============================================================================

#[derive(Debug, Clone)]
pub struct SimCpu {
    pub frame: MachineFrame,
    pub cr3: u64,
    pub thread_start: u64,
    pub responsive: bool,
    pub latency: Duration,
}

impl SimCpu {
    pub fn kernel(rip: u64, rsp: u64) -> Self {
        Self {
            frame: MachineFrame {
                rip,
                seg_cs: 0x10,
                rflags: 0x246,
                rsp,
                seg_ss: 0x18,
            },
            cr3: 0x1ad000,
            thread_start: 0,
            responsive: true,
            latency: Duration::ZERO,
        }
    }

    pub fn user(rip: u64, rsp: u64) -> Self {
        let mut cpu = Self::kernel(rip, rsp);
        cpu.frame.seg_cs = 0x33;
        cpu.frame.seg_ss = 0x2b;
        cpu
    }

    pub fn cr3(mut self, cr3: u64) -> Self {
        self.cr3 = cr3;
        self
    }

    pub fn thread_start(mut self, addr: u64) -> Self {
        self.thread_start = addr;
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.responsive = false;
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }
}

#[derive(Clone, Copy)]
struct TrapPtr(*const (dyn NmiTrap + 'static));

// The trap outlives every handler thread: `deregister` joins them.
unsafe impl Send for TrapPtr {}

impl TrapPtr {
    fn get(&self) -> &dyn NmiTrap {
        unsafe { &*self.0 }
    }
}

// =============================================================================
// Simulated Host
// =============================================================================

pub struct SimHost {
    cpus: Vec<SimCpu>,
    pages: BTreeMap<u64, Vec<u8>>,
    reported_cpus: AtomicUsize,
    fail_registration: AtomicBool,
    trap: Mutex<Option<TrapPtr>>,
    workers: Mutex<Vec<JoinHandle<bool>>>,
    nmi_log: Mutex<Vec<usize>>,
    delivered: Vec<AtomicUsize>,
    reads: Mutex<Vec<(u64, usize)>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl SimHost {
    pub fn new(cpus: Vec<SimCpu>) -> Self {
        let delivered = cpus.iter().map(|_| AtomicUsize::new(0)).collect();
        Self {
            reported_cpus: AtomicUsize::new(cpus.len()),
            cpus,
            pages: BTreeMap::new(),
            fail_registration: AtomicBool::new(false),
            trap: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            nmi_log: Mutex::new(Vec::new()),
            delivered,
            reads: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
            deregistrations: AtomicUsize::new(0),
        }
    }

    /// Map the page containing `addr` (zero-filled).
    pub fn map_page(&mut self, addr: u64) {
        self.pages
            .entry(addr & PAGE_MASK)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
    }

    /// Write native-endian words starting at `addr`, mapping pages as needed.
    pub fn write_words(&mut self, addr: u64, words: &[u64]) {
        for (i, word) in words.iter().enumerate() {
            let at = addr + (i * 8) as u64;
            self.map_page(at);
            let page = self.pages.get_mut(&(at & PAGE_MASK)).unwrap();
            let off = (at & !PAGE_MASK) as usize;
            page[off..off + 8].copy_from_slice(&word.to_ne_bytes());
        }
    }

    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    pub fn set_reported_cpus(&self, count: usize) {
        self.reported_cpus.store(count, Ordering::SeqCst);
    }

    pub fn nmi_log(&self) -> Vec<usize> {
        self.nmi_log.lock().unwrap().clone()
    }

    pub fn delivered(&self, cpu: usize) -> usize {
        self.delivered[cpu].load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }

    fn current(&self) -> &SimCpu {
        let cpu = CURRENT_CPU.with(|c| c.get());
        &self.cpus[cpu]
    }
}

impl ProcessorControl for SimHost {
    fn current_processor(&self) -> usize {
        CURRENT_CPU.with(|c| c.get())
    }

    fn max_processor_count(&self) -> usize {
        self.reported_cpus.load(Ordering::SeqCst)
    }

    fn read_page_table_base(&self) -> u64 {
        self.current().cr3
    }

    fn interrupted_frame(&self) -> MachineFrame {
        self.current().frame
    }

    fn current_thread_start_address(&self) -> u64 {
        self.current().thread_start
    }

    fn delay_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
        nmi_sweep::platform::advance_mock_time(us * 1000);
    }
}

impl MemoryProbe for SimHost {
    fn is_address_valid(&self, addr: u64) -> bool {
        self.pages.contains_key(&(addr & PAGE_MASK))
    }

    unsafe fn copy_from(&self, addr: u64, dst: &mut [u8]) {
        self.reads.lock().unwrap().push((addr, dst.len()));
        for (i, byte) in dst.iter_mut().enumerate() {
            let at = addr + i as u64;
            let page = self
                .pages
                .get(&(at & PAGE_MASK))
                .unwrap_or_else(|| panic!("read of unmapped address {:#x}", at));
            *byte = page[(at & !PAGE_MASK) as usize];
        }
    }
}

impl NmiDispatch for SimHost {
    type Registration = usize;

    fn register(&self, trap: &dyn NmiTrap) -> Option<usize> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return None;
        }
        let ptr: *const (dyn NmiTrap + '_) = trap;
        // SAFETY: only the lifetime is erased; `deregister` joins every
        // thread that can dereference the pointer.
        let ptr: *const (dyn NmiTrap + 'static) = unsafe { std::mem::transmute(ptr) };
        *self.trap.lock().unwrap() = Some(TrapPtr(ptr));
        Some(self.registrations.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn deregister(&self, _registration: usize) {
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            worker.join().expect("trap handler panicked");
        }
        *self.trap.lock().unwrap() = None;
        self.deregistrations.fetch_add(1, Ordering::SeqCst);
    }

    fn send_nmi(&self, target: &AffinityMask) {
        let trap = (*self.trap.lock().unwrap()).expect("NMI sent with no trap registered");
        for cpu in target.iter() {
            self.nmi_log.lock().unwrap().push(cpu);
            let Some(sim) = self.cpus.get(cpu) else {
                continue;
            };
            if !sim.responsive {
                continue;
            }
            self.delivered[cpu].fetch_add(1, Ordering::SeqCst);
            let latency = sim.latency;
            let worker = std::thread::spawn(move || {
                std::thread::sleep(latency);
                on_cpu(cpu, || trap.get().on_nmi())
            });
            self.workers.lock().unwrap().push(worker);
        }
    }
}

// =============================================================================
// Analysis Helpers
// =============================================================================

/// Probe that treats exactly the listed addresses as mapped.
pub struct MappedSet(pub BTreeSet<u64>);

impl MappedSet {
    pub fn of(addrs: &[u64]) -> Self {
        Self(addrs.iter().copied().collect())
    }
}

impl MemoryProbe for MappedSet {
    fn is_address_valid(&self, addr: u64) -> bool {
        self.0.contains(&addr)
    }
}

/// Module directory that counts walks.
pub struct CountingModules {
    pub ring: ModuleRing,
    walks: Cell<usize>,
}

impl CountingModules {
    pub fn new(ring: ModuleRing) -> Self {
        Self {
            ring,
            walks: Cell::new(0),
        }
    }

    pub fn walks(&self) -> usize {
        self.walks.get()
    }
}

impl ModuleDirectory for CountingModules {
    type Iter<'a> = RingIter<'a>;

    fn modules(&self) -> RingIter<'_> {
        self.walks.set(self.walks.get() + 1);
        self.ring.modules()
    }
}

/// The two-module list used throughout the tests.
pub fn modules_ab() -> ModuleRing {
    ModuleRing::new()
        .with(0x1000, 0x500, "A")
        .with(0x2000, 0x300, "B")
}

pub fn kernel_block(rip: u64, rsp: u64, stack: &[u64]) -> CaptureBlock {
    let mut block = CaptureBlock::new();
    block.rip = rip;
    block.rsp = rsp;
    block.cs = 0x10;
    block.ss = 0x18;
    block.usermode = false;
    let bytes: Vec<u8> = stack.iter().flat_map(|w| w.to_ne_bytes()).collect();
    block.set_stack(&bytes);
    block
}

pub fn user_block(rip: u64, rsp: u64) -> CaptureBlock {
    let mut block = CaptureBlock::new();
    block.rip = rip;
    block.rsp = rsp;
    block.cs = 0x33;
    block.ss = 0x2b;
    block.usermode = true;
    block
}
