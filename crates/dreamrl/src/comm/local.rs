//! In-process backend: one thread per rank, crossbeam channels between them.

use super::{CollectiveError, CommResult, CommunicationGroup, Payload};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Point-to-point channels of one group, indexed `[dst][src]`.
struct Channels {
    senders: Vec<Vec<Sender<Payload>>>,
    receivers: Vec<Vec<Receiver<Payload>>>,
}

impl Channels {
    fn new(size: usize) -> Self {
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
            senders.push(tx);
            receivers.push(rx);
        }
        Self { senders, receivers }
    }
}

/// Shared registry of the groups created by all ranks of one run.
///
/// Subgroups are keyed by their sorted world ranks, so every rank that asks
/// for the same members gets the same channels.
pub struct LocalHub {
    world_size: usize,
    timeout: Duration,
    groups: Mutex<HashMap<Vec<usize>, Arc<Channels>>>,
}

impl LocalHub {
    pub fn new(world_size: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            timeout,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// One world-group handle per rank, in rank order.
    pub fn world_groups(self: &Arc<Self>) -> Vec<LocalGroup> {
        let members: Vec<usize> = (0..self.world_size).collect();
        let channels = self.channels_for(&members);
        members
            .iter()
            .map(|&rank| LocalGroup {
                hub: Arc::clone(self),
                members: members.clone(),
                rank,
                channels: Arc::clone(&channels),
            })
            .collect()
    }

    fn channels_for(&self, members: &[usize]) -> Arc<Channels> {
        // A poisoned lock only means another rank panicked; the map is intact
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            groups
                .entry(members.to_vec())
                .or_insert_with(|| Arc::new(Channels::new(members.len()))),
        )
    }
}

pub struct LocalGroup {
    hub: Arc<LocalHub>,
    /// World ranks of the members, sorted
    members: Vec<usize>,
    /// Group-local rank
    rank: usize,
    channels: Arc<Channels>,
}

impl LocalGroup {
    /// World ranks of the members.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    fn send(&self, op: &'static str, dst: usize, payload: Payload) -> CommResult<()> {
        self.channels.senders[dst][self.rank]
            .send(payload)
            .map_err(|_| CollectiveError::Disconnected { op })
    }

    fn recv(&self, op: &'static str, src: usize) -> CommResult<Payload> {
        self.channels.receivers[self.rank][src]
            .recv_timeout(self.hub.timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => CollectiveError::Timeout {
                    op,
                    src: self.members[src],
                    secs: self.hub.timeout.as_secs(),
                },
                RecvTimeoutError::Disconnected => CollectiveError::Disconnected { op },
            })
    }

    fn check_rank(&self, rank: usize) -> CommResult<()> {
        if rank >= self.members.len() {
            return Err(CollectiveError::NotAMember { rank });
        }
        Ok(())
    }
}

impl CommunicationGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn global_rank(&self) -> usize {
        self.members[self.rank]
    }

    fn world_size(&self) -> usize {
        self.members.len()
    }

    fn broadcast(&self, payload: Option<Payload>, src: usize) -> CommResult<Payload> {
        self.check_rank(src)?;
        if self.rank != src {
            return self.recv("broadcast", src);
        }
        let payload = payload.ok_or(CollectiveError::RankMismatch {
            expected: 1,
            actual: 0,
        })?;
        for dst in (0..self.members.len()).filter(|&d| d != src) {
            self.send("broadcast", dst, payload.clone())?;
        }
        Ok(payload)
    }

    fn scatter(&self, payloads: Option<Vec<Payload>>, src: usize) -> CommResult<Payload> {
        self.check_rank(src)?;
        if self.rank != src {
            return self.recv("scatter", src);
        }
        let payloads = payloads.unwrap_or_default();
        if payloads.len() != self.members.len() {
            return Err(CollectiveError::RankMismatch {
                expected: self.members.len(),
                actual: payloads.len(),
            });
        }
        let mut own = None;
        for (dst, payload) in payloads.into_iter().enumerate() {
            if dst == src {
                own = Some(payload);
            } else {
                self.send("scatter", dst, payload)?;
            }
        }
        own.ok_or(CollectiveError::RankMismatch {
            expected: self.members.len(),
            actual: 0,
        })
    }

    fn gather(&self, payload: Payload, dst: usize) -> CommResult<Option<Vec<Payload>>> {
        self.check_rank(dst)?;
        if self.rank != dst {
            self.send("gather", dst, payload)?;
            return Ok(None);
        }
        let mut own = Some(payload);
        let mut out = Vec::with_capacity(self.members.len());
        for src in 0..self.members.len() {
            if src == dst {
                out.extend(own.take());
            } else {
                out.push(self.recv("gather", src)?);
            }
        }
        Ok(Some(out))
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> CommResult<()> {
        if self.members.len() == 1 {
            return Ok(());
        }
        let gathered = self.gather(Payload::Tensor(values.to_vec()), 0)?;
        let reduced = match gathered {
            Some(parts) => {
                let mut sum = vec![0.0f32; values.len()];
                for part in parts {
                    let part = part.into_tensor()?;
                    if part.len() != sum.len() {
                        return Err(CollectiveError::RankMismatch {
                            expected: sum.len(),
                            actual: part.len(),
                        });
                    }
                    for (s, v) in sum.iter_mut().zip(part) {
                        *s += v;
                    }
                }
                let n = self.members.len() as f32;
                sum.iter_mut().for_each(|s| *s /= n);
                self.broadcast(Some(Payload::Tensor(sum)), 0)?
            }
            None => self.broadcast(None, 0)?,
        };
        let reduced = reduced.into_tensor()?;
        if reduced.len() != values.len() {
            return Err(CollectiveError::RankMismatch {
                expected: values.len(),
                actual: reduced.len(),
            });
        }
        values.copy_from_slice(&reduced);
        Ok(())
    }

    fn create_subgroup(&self, world_ranks: &[usize]) -> CommResult<Box<dyn CommunicationGroup>> {
        let mut members = world_ranks.to_vec();
        members.sort_unstable();
        members.dedup();
        if let Some(&outsider) = members.iter().find(|r| !self.members.contains(r)) {
            return Err(CollectiveError::NotAMember { rank: outsider });
        }
        let me = self.global_rank();
        let rank = members
            .iter()
            .position(|&r| r == me)
            .ok_or(CollectiveError::NotAMember { rank: me })?;
        let channels = self.hub.channels_for(&members);
        Ok(Box::new(LocalGroup {
            hub: Arc::clone(&self.hub),
            members,
            rank,
            channels,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_world<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let hub = LocalHub::new(world_size, Duration::from_secs(10));
        let f = Arc::new(f);
        let handles: Vec<_> = hub
            .world_groups()
            .into_iter()
            .map(|group| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce_mean() {
        let results = spawn_world(3, |group| {
            let mut values = vec![group.rank() as f32, 1.0];
            group.all_reduce_mean(&mut values).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![1.0, 1.0]);
        }
    }

    #[test]
    fn test_scatter_delivers_by_rank() {
        let results = spawn_world(3, |group| {
            let payloads = (group.rank() == 0)
                .then(|| (0..3).map(|i| Payload::Tensor(vec![i as f32])).collect());
            group.scatter(payloads, 0).unwrap().into_tensor().unwrap()
        });
        assert_eq!(results, vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_subgroup_uses_local_ranks() {
        let results = spawn_world(4, |group| {
            if group.global_rank() == 0 {
                return None;
            }
            let learners = group.create_subgroup(&[3, 1, 2]).unwrap();
            let payload = (learners.rank() == 0).then(|| Payload::Tensor(vec![42.0]));
            let got = learners.broadcast(payload, 0).unwrap().into_tensor().unwrap();
            Some((learners.rank(), got))
        });
        assert_eq!(results[0], None);
        assert_eq!(results[1], Some((0, vec![42.0])));
        assert_eq!(results[3], Some((2, vec![42.0])));
    }

    #[test]
    fn test_subgroup_rejects_non_member() {
        let hub = LocalHub::new(3, Duration::from_secs(1));
        let world = hub.world_groups();
        assert!(matches!(
            world[0].create_subgroup(&[1, 2]),
            Err(CollectiveError::NotAMember { rank: 0 })
        ));
        assert!(matches!(
            world[1].create_subgroup(&[1, 7]),
            Err(CollectiveError::NotAMember { rank: 7 })
        ));
    }

    #[test]
    fn test_receive_times_out() {
        let hub = LocalHub::new(2, Duration::from_millis(50));
        let world = hub.world_groups();
        let err = world[1].broadcast(None, 0).unwrap_err();
        assert!(matches!(err, CollectiveError::Timeout { op: "broadcast", src: 0, .. }));
    }

    #[test]
    fn test_scatter_requires_one_payload_per_rank() {
        let hub = LocalHub::new(2, Duration::from_millis(50));
        let world = hub.world_groups();
        let err = world[0]
            .scatter(Some(vec![Payload::Tensor(vec![])]), 0)
            .unwrap_err();
        assert!(matches!(err, CollectiveError::RankMismatch { expected: 2, actual: 1 }));
    }
}
