//! In-process multi-rank backend.
//!
//! Ranks are threads sharing a mailbox table. Each `(source, destination,
//! tag)` triple keys a FIFO queue, which reproduces the MPI non-overtaking
//! rule the level-scheduled protocols rely on. Collectives rendezvous
//! through shared state and combine contributions in rank order, so a
//! reduction over a fixed set of inputs is bit-reproducible no matter how
//! the threads are scheduled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::{CommError, Parallel, Real, ReduceOp, Request, Tag};

type MailKey = (usize, usize, Tag);

#[derive(Default)]
struct Rendezvous {
    contrib: Vec<Option<Vec<Real>>>,
    arrived: usize,
    departed: usize,
    result: Option<Vec<Real>>,
}

struct Shared {
    size: usize,
    mail: Mutex<HashMap<MailKey, VecDeque<Vec<Real>>>>,
    mail_cv: Condvar,
    coll: Mutex<Rendezvous>,
    coll_cv: Condvar,
}

/// One rank of an in-process communicator group.
///
/// Create a group with [`ThreadComm::split`] and hand one instance to each
/// rank's thread.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

/// Request type for [`ThreadComm`].
#[derive(Debug)]
pub enum ThreadRequest {
    /// A send; staged at post time, nothing left to wait for.
    Send,
    /// A receive, filled in by `waitall`.
    Recv {
        /// Sending rank.
        src: usize,
        /// Message tag.
        tag: Tag,
        /// Expected length in values.
        len: usize,
        /// Payload once completed.
        data: Option<Vec<Real>>,
    },
}

impl Request for ThreadRequest {
    fn payload(&self) -> &[Real] {
        match self {
            ThreadRequest::Send => &[],
            ThreadRequest::Recv { data, .. } => data.as_deref().unwrap_or(&[]),
        }
    }
}

impl ThreadComm {
    /// Create a communicator group of `size` ranks.
    pub fn split(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            size,
            mail: Mutex::new(HashMap::new()),
            mail_cv: Condvar::new(),
            coll: Mutex::new(Rendezvous {
                contrib: (0..size).map(|_| None).collect(),
                ..Rendezvous::default()
            }),
            coll_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.shared.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.shared.size,
            });
        }
        Ok(())
    }
}

impl Parallel for ThreadComm {
    type Request = ThreadRequest;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn isend(&self, buf: &[Real], dest: usize, tag: Tag) -> Result<ThreadRequest, CommError> {
        self.check_rank(dest)?;
        let mut mail = self.shared.mail.lock().unwrap();
        mail.entry((self.rank, dest, tag))
            .or_default()
            .push_back(buf.to_vec());
        self.shared.mail_cv.notify_all();
        Ok(ThreadRequest::Send)
    }

    fn irecv(&self, len: usize, src: usize, tag: Tag) -> Result<ThreadRequest, CommError> {
        self.check_rank(src)?;
        Ok(ThreadRequest::Recv {
            src,
            tag,
            len,
            data: None,
        })
    }

    fn waitall(&self, reqs: &mut [ThreadRequest]) -> Result<(), CommError> {
        for req in reqs {
            let ThreadRequest::Recv {
                src,
                tag,
                len,
                data,
            } = req
            else {
                continue;
            };
            if data.is_some() {
                continue;
            }
            let key = (*src, self.rank, *tag);
            let mut mail = self.shared.mail.lock().unwrap();
            let msg = loop {
                if let Some(msg) = mail.get_mut(&key).and_then(VecDeque::pop_front) {
                    break msg;
                }
                mail = self.shared.mail_cv.wait(mail).unwrap();
            };
            drop(mail);
            if msg.len() != *len {
                return Err(CommError::SizeMismatch {
                    src: *src,
                    want: *len,
                    got: msg.len(),
                });
            }
            *data = Some(msg);
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        local: &[Real],
        global: &mut [Real],
        op: ReduceOp,
    ) -> Result<(), CommError> {
        if local.len() != global.len() {
            return Err(CommError::CollectiveMismatch {
                send: local.len(),
                recv: global.len(),
            });
        }
        let shared = &self.shared;
        let mut st = shared.coll.lock().unwrap();
        // The previous round is over once our contribution slot is free.
        while st.contrib[self.rank].is_some() {
            st = shared.coll_cv.wait(st).unwrap();
        }
        st.contrib[self.rank] = Some(local.to_vec());
        st.arrived += 1;
        if st.arrived == shared.size {
            // Last to arrive combines, in rank order.
            let mut acc = st.contrib[0].clone().expect("rank 0 contribution");
            for r in 1..shared.size {
                op.apply(&mut acc, st.contrib[r].as_ref().expect("contribution"));
            }
            st.result = Some(acc);
            st.departed = 0;
            shared.coll_cv.notify_all();
        }
        while st.result.is_none() {
            st = shared.coll_cv.wait(st).unwrap();
        }
        global.copy_from_slice(st.result.as_ref().expect("result"));
        st.departed += 1;
        if st.departed == shared.size {
            for c in st.contrib.iter_mut() {
                *c = None;
            }
            st.result = None;
            st.arrived = 0;
            shared.coll_cv.notify_all();
        }
        Ok(())
    }

    fn barrier(&self) {
        let mut out: [Real; 0] = [];
        self.all_reduce(&[], &mut out, ReduceOp::Sum)
            .expect("barrier");
    }
}
