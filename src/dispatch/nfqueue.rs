//! Per-packet dispatch
//!
//! The core procedure: parse the packet, find or create its session, fan
//! the message out to the subscribed plugins in strictly increasing
//! priority layers, merge the returned mark bits, and hand a single verdict
//! back to the kernel. The dispatch itself never drops a packet; plugins
//! express intent through mark bits.

use super::message::NfqueueMessage;
use super::session::Session;
use super::subscription::MAX_PRIORITY;
use super::tuple::Tuple;
use super::DispatchEngine;
use crate::dict::{DictValue, BYPASS_KEY};
use crate::kernel::{Verdict, NEW_FLOW_MARK};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Maximum time a plugin is allowed to process one packet. When exceeded
/// the packet passes without that plugin's mark and the session is released
/// on behalf of the offending plugin.
pub const MAX_ALLOWED_TIME: Duration = Duration::from_secs(30);

/// Outcome returned by a plugin handler for one packet.
#[derive(Debug, Clone)]
pub struct NfqueueResult {
    /// Must equal the subscription owner; used as the release key.
    pub owner: String,
    /// OR'd into the outgoing packet mark.
    pub packet_mark: u32,
    /// True to stop receiving packets for this session.
    pub session_release: bool,
}

/// Nfqueue handler: `(message, ctid, new_session)`.
pub type NfqueueFunc =
    Arc<dyn Fn(Arc<NfqueueMessage>, u32, bool) -> NfqueueResult + Send + Sync>;

impl DispatchEngine {
    /// Handles one queued packet and returns the verdict and outgoing mark.
    ///
    /// Invoked concurrently from the kernel shim's worker threads. The
    /// `0x10000000` bit of `pmark` flags the first packet of a kernel flow.
    pub async fn nfqueue_callback(
        &self,
        ctid: u32,
        packet: &[u8],
        length: usize,
        pmark: u32,
    ) -> (Verdict, u32) {
        self.metrics.packets_dispatched.inc();

        let Some(mut mess) = NfqueueMessage::parse(packet.to_vec(), length) else {
            self.metrics.non_ip_accepted.inc();
            return (Verdict::Accept, pmark);
        };

        let new_session = (pmark & NEW_FLOW_MARK) != 0;
        trace!("nfqueue event[{}]: {}", ctid, mess.tuple);

        let (found, client_to_server) = self.lookup_session(&mess.tuple);
        mess.client_to_server = client_to_server;

        let (session, created) = match found {
            None => {
                if !new_session {
                    // the first packet was never seen, so no session can be
                    // built that honors the client/server orientation; hand
                    // the flow back to the kernel
                    info!("ignoring mid-session packet: {} {}", mess.tuple, ctid);
                    self.dict
                        .add_session_entry(ctid, BYPASS_KEY, DictValue::Bool(true));
                    self.metrics.midflow_bypasses.inc();
                    return (Verdict::Accept, pmark);
                }
                (self.create_session(&mess, ctid), true)
            }
            Some(existing) => {
                let mut session = existing;
                let mut created = false;
                if new_session {
                    if session.is_conntrack_confirmed() {
                        error!(
                            "conflicting session tuple: {} {} != {}",
                            mess.tuple,
                            ctid,
                            session.conntrack_id()
                        );
                    } else {
                        // an aborted flow whose first packet was dropped
                        // before conntrack confirm; evict it
                        debug!(
                            "conflicting session tuple: {} {} != {}",
                            mess.tuple,
                            ctid,
                            session.conntrack_id()
                        );
                        self.sessions
                            .remove(&session.client_side_tuple().forward());
                        self.metrics.sessions_collided.inc();
                        session = self.create_session(&mess, ctid);
                        created = true;
                    }
                }
                if session.conntrack_id() != ctid {
                    error!(
                        "conntrack id mismatch: {} {} != {} {}",
                        mess.tuple,
                        ctid,
                        session.conntrack_id(),
                        session.is_conntrack_confirmed()
                    );
                }
                (session, created)
            }
        };

        // a fresh session already accounts for its first packet
        if !created {
            session.record_packet(length as u64);
        }
        mess.session = Some(session.clone());

        self.call_subscribers(ctid, &session, Arc::new(mess), pmark, new_session)
            .await
    }

    /// Probes the forward tuple, then the reverse. The bool is the packet
    /// direction: true for client-to-server.
    fn lookup_session(&self, tuple: &Tuple) -> (Option<Arc<Session>>, bool) {
        if let Some(session) = self.sessions.find_by_tuple(&tuple.forward()) {
            trace!("session found {} in table", session.session_id());
            return (Some(session), true);
        }

        if let Some(session) = self.sessions.find_by_tuple(&tuple.reverse()) {
            trace!("session found {} in table", session.session_id());
            return (Some(session), false);
        }

        (None, true)
    }

    /// Creates a session for the first packet of a flow and inserts the
    /// forward mapping into the session table.
    fn create_session(&self, mess: &NfqueueMessage, ctid: u32) -> Arc<Session> {
        let session = Arc::new(Session::new(
            self.next_session_id(),
            ctid,
            mess.tuple.clone(),
            mess.length as u64,
        ));
        session.attach_subscriptions(self.registry.mirror_nfqueue());
        trace!("session adding {} to table", session.session_id());
        self.sessions.insert(mess.tuple.forward(), session.clone());
        self.metrics.sessions_created.inc();
        self.metrics
            .session_table_size
            .set(self.sessions.len() as u64);
        session
    }

    /// Calls every subscriber on the session in priority layers and merges
    /// the results into the outgoing mark.
    async fn call_subscribers(
        &self,
        ctid: u32,
        session: &Arc<Session>,
        mess: Arc<NfqueueMessage>,
        mut pmark: u32,
        new_session: bool,
    ) -> (Verdict, u32) {
        let sublist = session.mirror_subscriptions();
        let subtotal = sublist.len();
        let mut subcount = 0usize;
        let mut priority = 0u32;
        let guard = self.settings.plugin_timeout;

        // walk the priorities upward until every subscriber has been called
        while subcount != subtotal {
            if priority > u32::from(MAX_PRIORITY) {
                // unreachable given the registration range check
                panic!(
                    "subscription priority constraint failed: {} of {} handlers dispatched",
                    subcount, subtotal
                );
            }

            let mut layer = Vec::new();
            for holder in sublist.values() {
                if u32::from(holder.priority) != priority {
                    continue;
                }
                trace!(
                    "calling nfqueue plugin:{} priority:{} session_id:{}",
                    holder.owner,
                    priority,
                    session.session_id()
                );

                let owner = holder.owner.clone();
                let func = holder.func.clone();
                let mess = mess.clone();
                let metrics = self.metrics.clone();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let work =
                        tokio::task::spawn_blocking(move || func(mess, ctid, new_session));

                    let result = match tokio::time::timeout(guard, work).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => {
                            error!("nfqueue plugin {} failed: {}", owner, join_error);
                            NfqueueResult {
                                owner: owner.clone(),
                                packet_mark: 0,
                                session_release: true,
                            }
                        }
                        Err(_) => {
                            // the handler is abandoned, never killed; its
                            // eventual result is discarded
                            error!("timeout reached while processing nfqueue plugin:{}", owner);
                            metrics.handler_timeouts.inc();
                            NfqueueResult {
                                owner: owner.clone(),
                                packet_mark: 0,
                                session_release: true,
                            }
                        }
                    };

                    trace!(
                        "finished nfqueue plugin:{} ms:{:.1}",
                        result.owner,
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                    result
                });
                layer.push(handle);
                subcount += 1;
            }

            // layer barrier: every handler returns or times out before the
            // next priority begins
            for handle in layer {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!("nfqueue dispatch task failed: {}", join_error);
                        continue;
                    }
                };

                pmark |= result.packet_mark;
                if result.session_release {
                    self.metrics.session_releases.inc();
                    if session.release_subscription(&result.owner, &self.dict) {
                        self.metrics.bypasses_set.inc();
                    }
                }
            }

            priority += 1;
        }

        (Verdict::Accept, pmark)
    }
}
