use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::provider::WorkerInstance;
use crate::worker::Worker;

/// Bounded worker population with lazy spawning and a spawn-rate throttle.
///
/// The pool itself is plain data; the scheduler owns it behind its state
/// lock. Spawning is split in two so the provider call happens outside that
/// lock: `reserve_slot` commits capacity and the spawn timestamp, and
/// `finish_spawn` either installs the worker or releases the reservation.
pub(crate) struct WorkerPool<D, I: WorkerInstance<D>> {
    workers: Vec<Arc<Worker<D, I>>>,
    starting: usize,
    next_worker_id: usize,
    last_spawn_at: Option<Instant>,
    max_concurrency: usize,
    creation_delay: Duration,
}

impl<D, I> WorkerPool<D, I>
where
    D: Clone + Send + Sync + 'static,
    I: WorkerInstance<D>,
{
    pub fn new(max_concurrency: usize, creation_delay: Duration) -> Self {
        Self {
            workers: Vec::new(),
            starting: 0,
            next_worker_id: 0,
            last_spawn_at: None,
            max_concurrency,
            creation_delay,
        }
    }

    /// Some live worker is willing to take this job right now.
    pub fn any_can_handle(&self, data: &D) -> bool {
        self.workers.iter().any(|w| w.can_handle(data))
    }

    /// A new worker may be spawned: capacity left and the spawn throttle has
    /// cooled down.
    pub fn can_launch(&self) -> bool {
        if self.workers.len() + self.starting >= self.max_concurrency {
            return false;
        }
        self.last_spawn_at
            .is_none_or(|at| at.elapsed() >= self.creation_delay)
    }

    /// A job could run now or after a permitted spawn.
    pub fn has_free_capacity(&self, data: Option<&D>) -> bool {
        match data {
            Some(data) => self.any_can_handle(data) || self.can_launch(),
            None => self.workers.iter().any(|w| w.active_jobs() == 0) || self.can_launch(),
        }
    }

    /// Claim a spawn slot; the caller must follow up with `finish_spawn`.
    /// Returns the id the new worker will carry.
    pub fn reserve_slot(&mut self) -> usize {
        self.starting += 1;
        self.last_spawn_at = Some(Instant::now());
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        id
    }

    /// Complete (or abandon, on provider failure) a reserved spawn.
    pub fn finish_spawn(&mut self, worker: Option<Worker<D, I>>) {
        debug_assert!(self.starting > 0);
        self.starting = self.starting.saturating_sub(1);
        if let Some(worker) = worker {
            self.workers.push(Arc::new(worker));
        }
    }

    /// First willing worker, oldest id first. Stable across calls.
    pub fn get_worker(&self, data: &D) -> Option<Arc<Worker<D, I>>> {
        self.workers.iter().find(|w| w.can_handle(data)).cloned()
    }

    pub fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.active_jobs() > 0).count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn starting(&self) -> usize {
        self.starting
    }

    /// Detach workers that outlived their provider-declared idle TTL.
    /// The caller closes them outside the lock.
    pub fn evict_idle(&mut self) -> Vec<Arc<Worker<D, I>>> {
        let mut evicted = Vec::new();
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].idle_expired() {
                evicted.push(self.workers.remove(i));
            } else {
                i += 1;
            }
        }
        evicted
    }

    /// Drain every worker for shutdown.
    pub fn take_workers(&mut self) -> Vec<Arc<Worker<D, I>>> {
        std::mem::take(&mut self.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn pool(max: usize, delay: Duration) -> WorkerPool<u32, MockWorkerInstance> {
        WorkerPool::new(max, delay)
    }

    fn spawn_into(pool: &mut WorkerPool<u32, MockWorkerInstance>, script: &MockScript) {
        let id = pool.reserve_slot();
        pool.finish_spawn(Some(Worker::new(
            id,
            MockWorkerInstance::new(id, script.clone(), None),
        )));
    }

    #[test]
    fn test_population_cap_counts_starting_workers() {
        let script = MockScript::default();
        let mut p = pool(2, Duration::ZERO);
        assert!(p.can_launch());

        let _ = p.reserve_slot();
        assert_eq!(p.starting(), 1);
        assert!(p.can_launch());

        spawn_into(&mut p, &script);
        // one live + one still starting == cap
        assert!(!p.can_launch());

        p.finish_spawn(None);
        assert_eq!(p.starting(), 0);
        assert!(p.can_launch());
    }

    #[tokio::test]
    async fn test_spawn_throttle_spaces_launches() {
        let script = MockScript::default();
        let mut p = pool(4, Duration::from_millis(50));

        spawn_into(&mut p, &script);
        assert!(!p.can_launch(), "second spawn must wait out the delay");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(p.can_launch());
    }

    #[test]
    fn test_routing_prefers_oldest_worker() {
        let script = MockScript::default();
        let mut p = pool(3, Duration::ZERO);
        spawn_into(&mut p, &script);
        spawn_into(&mut p, &script);

        let w = p.get_worker(&0).expect("a worker should be free");
        assert_eq!(w.id(), 0);

        // Oldest goes busy; routing falls through to the next id.
        w.begin_job();
        let w = p.get_worker(&0).expect("second worker should be free");
        assert_eq!(w.id(), 1);
        assert_eq!(p.busy_count(), 1);
    }

    #[test]
    fn test_no_worker_when_all_busy() {
        let script = MockScript::default();
        let mut p = pool(1, Duration::ZERO);
        spawn_into(&mut p, &script);

        p.get_worker(&0).expect("fresh worker is free").begin_job();
        assert!(p.get_worker(&0).is_none());
        assert!(!p.any_can_handle(&0));
        assert!(!p.has_free_capacity(Some(&0)), "cap reached, all busy");
    }

    #[tokio::test]
    async fn test_evict_idle_respects_ttl_and_busyness() {
        let script = MockScript::default();
        let mut p = pool(3, Duration::ZERO);

        let id = p.reserve_slot();
        let instance = MockWorkerInstance::new(id, script.clone(), None)
            .with_idle_ttl(Duration::from_millis(20));
        p.finish_spawn(Some(Worker::new(id, instance)));

        let id = p.reserve_slot();
        p.finish_spawn(Some(Worker::new(
            id,
            MockWorkerInstance::new(id, script.clone(), None),
        )));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let evicted = p.evict_idle();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), 0);
        assert_eq!(p.worker_count(), 1, "no-TTL worker survives");
    }
}
