//! The multithreaded page-copy engine.
//!
//! Bulk copies are partitioned across worker threads pinned (best effort)
//! to the CPUs of the destination node. Workers drain a shared
//! high-priority queue; the submitting thread blocks until every chunk of
//! its batch has been written.
use std::{
    sync::{
        atomic::Ordering,
        Arc,
        Condvar,
        Mutex,
    },
    thread,
};

use crate::{
    deps::{
        crossbeam_channel::{
            unbounded,
            Sender,
        },
        log::{
            debug,
            warn,
        },
        num_cpus,
    },
    config::MAX_MT_WORKERS,
    error::Error,
    frames::{
        FrameArena,
        WORDS_PER_PAGE,
    },
    node::Machine,
    page::PhysicalPage,
};


macro_rules! warn_once {
        ($name:ident; $($arg:tt)+) => {{
            use $crate::deps::lazy_static::lazy_static;
            use $crate::deps::log::warn;

            lazy_static! {
                static ref $name: ::std::sync::Once = ::std::sync::Once::new();
            }

            (&*($name)).call_once(|| {
                warn!("[WARN_ONCE] {}", format_args!($($arg)*))
            })
       }};
}


/// Fan-in point for one submission: the caller sleeps until every queued
/// chunk has completed.
pub struct Batch {
    remaining: Mutex<usize>,
    cv:        Condvar,
}


impl Batch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(0),
            cv:        Condvar::new(),
        })
    }

    fn add(&self) {
        *self.remaining.lock().unwrap() += 1;
    }

    fn done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Flush: block until all submitted work has run.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.cv.wait(remaining).unwrap();
        }
    }
}


struct Job {
    batch: Arc<Batch>,
    run:   Box<dyn FnOnce() + Send + 'static>,
}


/// One worker per machine CPU, each fed by its own queue so work lands on
/// the CPU it was aimed at.
pub struct CopyPool {
    queues:  Vec<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}


impl CopyPool {
    pub fn new(nr_cpus: usize) -> Self {
        let mut queues = Vec::with_capacity(nr_cpus);
        let mut workers = Vec::with_capacity(nr_cpus);

        for cpu in 0..nr_cpus {
            let (tx, rx) = unbounded::<Job>();
            queues.push(tx);
            workers.push(
                thread::Builder::new()
                    .name(format!("copyd/{}", cpu))
                    .spawn(move || {
                        pin_to_cpu(cpu);
                        for job in rx.iter() {
                            (job.run)();
                            job.batch.done();
                        }
                    })
                    .expect("failed to spawn copy worker"),
            );
        }

        Self { queues, workers }
    }

    pub fn nr_workers(&self) -> usize {
        self.queues.len()
    }

    /// `queue_work_on()`: enqueue a chunk on the worker serving `cpu`.
    pub fn queue_work_on<F>(
        &self,
        cpu: usize,
        batch: &Arc<Batch>,
        run: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        batch.add();
        let job = Job {
            batch: Arc::clone(batch),
            run:   Box::new(run),
        };
        if let Err(err) = self.queues[cpu % self.queues.len()].send(job) {
            // A dead worker cannot complete the chunk; run it inline so the
            // flush cannot hang.
            warn!("copy worker {} is gone ({}), running chunk inline", cpu, err);
            let job = err.into_inner();
            (job.run)();
            job.batch.done();
        }
    }
}


impl Drop for CopyPool {
    fn drop(&mut self) {
        self.queues.clear();
        for worker in self.workers.drain(..) {
            worker.join().unwrap_or_else(|_| warn!("copy worker panicked"));
        }
    }
}


fn pin_to_cpu(cpu: usize) {
    use crate::deps::nix::{
        sched::{
            sched_setaffinity,
            CpuSet,
        },
        unistd::Pid,
    };

    let host_cpu = cpu % num_cpus::get();
    let mut cpuset = CpuSet::new();
    if cpuset.set(host_cpu).is_ok() {
        if let Err(err) = sched_setaffinity(Pid::from_raw(0), &cpuset) {
            warn_once!(COPY_WORKER_PIN_FAILED;
                "unable to pin copy workers, reason: {:?}", err);
        }
    }
}


/// Picks the worker CPUs for a bulk operation aimed at `nid`: the fan-out
/// is capped by the configured limit and by the CPUs of the node, rounded
/// down to an even count when parallel, and must land in
/// `[1, MAX_MT_WORKERS]`.
pub(crate) fn mt_fanout(
    machine: &Machine,
    nid: usize,
    round_even: bool,
) -> Result<Vec<usize>, Error> {
    let mut total = std::cmp::min(machine.config().limit_mt_num() as usize, machine.cpus_on(nid));
    if round_even && total > 1 {
        total = (total / 2) * 2;
    }

    if total > MAX_MT_WORKERS as usize || total < 1 {
        return Err(Error::NoDevice {
            requested: total as u32,
            max:       MAX_MT_WORKERS,
        });
    }

    Ok(machine.node(nid).cpus()[..total].to_vec())
}


pub(crate) fn copy_words(
    to: &[std::sync::atomic::AtomicU64],
    from: &[std::sync::atomic::AtomicU64],
) {
    debug_assert_eq!(to.len(), from.len());
    for (t, f) in to.iter().zip(from.iter()) {
        t.store(f.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}


fn copy_chunk(
    arena: &Arc<FrameArena>,
    to_word: usize,
    from_word: usize,
    nr_words: usize,
) {
    copy_words(
        arena.words_at(to_word, nr_words),
        arena.words_at(from_word, nr_words),
    );
}


/// Copies the contents of `from` into `to`, both `nr_pages` base pages
/// long, split evenly across the destination node's copy workers.
pub fn copy_page_multithread(
    machine: &Machine,
    to: &Arc<PhysicalPage>,
    from: &Arc<PhysicalPage>,
    nr_pages: usize,
) -> Result<(), Error> {
    let cpus = mt_fanout(machine, to.nid(), true)?;
    let total = cpus.len();

    let nr_words = WORDS_PER_PAGE * nr_pages;
    let chunk = nr_words / total;
    let to_base = to.pfn().as_usize() * WORDS_PER_PAGE;
    let from_base = from.pfn().as_usize() * WORDS_PER_PAGE;

    let batch = Batch::new();
    for (i, &cpu) in cpus.iter().enumerate() {
        // The last worker also takes the words an uneven split leaves over.
        let nr_words = if i == total - 1 { nr_words - i * chunk } else { chunk };
        let arena = Arc::clone(machine.arena());
        machine.pool().queue_work_on(cpu, &batch, move || {
            copy_chunk(&arena, to_base + i * chunk, from_base + i * chunk, nr_words);
        });
    }
    batch.wait();

    debug!(
        "multithread copy {:?} -> {:?}: {} pages over {} workers",
        from.pfn(),
        to.pfn(),
        nr_pages,
        total,
    );
    Ok(())
}


/// Copies a batch of page pairs. With fewer items than workers each page is
/// sliced across several workers; otherwise whole pages are dealt out
/// round-robin, the first `nr_items % total` workers taking one extra.
pub fn copy_page_lists_multithread(
    machine: &Machine,
    to: &[Arc<PhysicalPage>],
    from: &[Arc<PhysicalPage>],
) -> Result<(), Error> {
    debug_assert_eq!(to.len(), from.len());
    if to.is_empty() {
        return Ok(());
    }

    let cpus = mt_fanout(machine, to[0].nid(), false)?;
    let total = cpus.len();
    let nr_items = to.len();
    let batch = Batch::new();

    if nr_items < total {
        // Every worker sees a slice of every page.
        for (to_page, from_page) in to.iter().zip(from.iter()) {
            debug_assert_eq!(to_page.nr_pages(), from_page.nr_pages());
            let nr_words = WORDS_PER_PAGE * from_page.nr_pages();
            debug_assert_eq!(nr_words % total, 0);
            let chunk = nr_words / total;
            let to_base = to_page.pfn().as_usize() * WORDS_PER_PAGE;
            let from_base = from_page.pfn().as_usize() * WORDS_PER_PAGE;

            for (i, &cpu) in cpus.iter().enumerate() {
                let arena = Arc::clone(machine.arena());
                machine.pool().queue_work_on(cpu, &batch, move || {
                    copy_chunk(&arena, to_base + i * chunk, from_base + i * chunk, chunk);
                });
            }
        }
    } else {
        for (item, (to_page, from_page)) in to.iter().zip(from.iter()).enumerate() {
            debug_assert_eq!(to_page.nr_pages(), from_page.nr_pages());
            let nr_words = WORDS_PER_PAGE * from_page.nr_pages();
            let to_base = to_page.pfn().as_usize() * WORDS_PER_PAGE;
            let from_base = from_page.pfn().as_usize() * WORDS_PER_PAGE;

            let cpu = cpus[item % total];
            let arena = Arc::clone(machine.arena());
            machine.pool().queue_work_on(cpu, &batch, move || {
                copy_chunk(&arena, to_base, from_base, nr_words);
            });
        }
    }

    batch.wait();
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MachineSpec;

    fn machine_with_cpus(cpus: usize) -> Arc<Machine> {
        Machine::new(MachineSpec::two_tier(1, 1, cpus, 64)).unwrap()
    }

    #[test]
    fn multithread_copy_matches_single_memcpy() {
        let machine = machine_with_cpus(4);
        let from = machine.alloc_page(0, 2).unwrap();
        let to = machine.alloc_page(0, 2).unwrap();

        for (i, word) in from.data().iter().enumerate() {
            word.store(i as u64 * 0x9E37_79B9, Ordering::Relaxed);
        }
        to.fill(0x00);

        copy_page_multithread(&machine, &to, &from, from.nr_pages()).unwrap();
        assert_eq!(to.snapshot_bytes(), from.snapshot_bytes());
    }

    #[test]
    fn fanout_is_rounded_down_to_even() {
        let machine = machine_with_cpus(3);
        machine.config().set_limit_mt_num(32).unwrap();
        let cpus = mt_fanout(&machine, 0, true).unwrap();
        assert_eq!(cpus.len(), 2);

        let odd_ok = mt_fanout(&machine, 0, false).unwrap();
        assert_eq!(odd_ok.len(), 3);
    }

    #[test]
    fn fanout_outside_range_is_no_device() {
        let machine = Machine::new(MachineSpec {
            nodes: vec![
                crate::node::NodeSpec {
                    tier:      crate::node::Tier::Top,
                    cpus:      2,
                    frames:    16,
                    watermark: 0,
                },
                crate::node::NodeSpec {
                    tier:      crate::node::Tier::Bottom,
                    cpus:      0,
                    frames:    16,
                    watermark: 0,
                },
            ],
            thp:   false,
        })
        .unwrap();

        // The cpuless bottom node cannot host any copy workers.
        match mt_fanout(&machine, 1, true) {
            Err(Error::NoDevice { requested: 0, .. }) => {}
            other => panic!("expected NoDevice, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn list_copy_handles_both_regimes() {
        let machine = machine_with_cpus(4);
        machine.config().set_limit_mt_num(4).unwrap();

        // More items than workers: whole-page round robin.
        let mut from_pages = Vec::new();
        let mut to_pages = Vec::new();
        for i in 0..6u8 {
            let from = machine.alloc_page(0, 0).unwrap();
            let to = machine.alloc_page(1, 0).unwrap();
            from.fill(0x10 + i);
            to.fill(0);
            from_pages.push(from);
            to_pages.push(to);
        }
        copy_page_lists_multithread(&machine, &to_pages, &from_pages).unwrap();
        for (to, from) in to_pages.iter().zip(from_pages.iter()) {
            assert_eq!(to.snapshot_bytes(), from.snapshot_bytes());
        }

        // Fewer items than workers: sub-page chunking.
        let from = machine.alloc_page(0, 0).unwrap();
        let to = machine.alloc_page(1, 0).unwrap();
        from.fill(0x77);
        to.fill(0);
        copy_page_lists_multithread(
            &machine,
            &[Arc::clone(&to)],
            &[Arc::clone(&from)],
        )
        .unwrap();
        assert_eq!(to.snapshot_bytes(), from.snapshot_bytes());
    }
}
