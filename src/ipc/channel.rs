//! Single-slot request/acknowledge state machine

use tracing::{debug, instrument, trace};

use crate::error::{Error, NackReason, Result};
use crate::ipc::request::{IpcReply, IpcRequest, Param};
use crate::ipc::response::ResponseArea;
use crate::ipc::transport::{DeliveryFailure, Transport};

/// The different states of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    AckPending,
    NackPending,
}

/// Produces the payload for a serviced request.
pub trait RequestService {
    /// Fill `area` for `param`.
    ///
    /// Returning [`Error::InvalidRequest`] answers the request with a
    /// negative acknowledgement; any other error is fatal.
    fn respond(&mut self, request: &IpcRequest, param: Param, area: &mut ResponseArea) -> Result<()>;
}

/// Mediates the one request in flight between the appliance and the user
/// interface.
///
/// `Idle → AckPending → Idle` and `Idle → NackPending → Idle` are the only
/// transitions. While a reply is pending no new request is taken from the
/// transport.
pub struct IpcRequestChannel<T> {
    transport: T,
    state: RequestState,
    request: Option<IpcRequest>,
    reply: Option<IpcReply>,
}

impl<T: Transport> IpcRequestChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: RequestState::Idle,
            request: None,
            reply: None,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// The request received but not yet answered, if any
    pub fn pending_request(&self) -> Option<&IpcRequest> {
        self.request.as_ref()
    }

    /// Return the parameter id of the next request, or `None` when no
    /// message is available.
    ///
    /// A request that was received but not serviced is reported again.
    pub fn check_for_request(&mut self) -> Result<Option<u32>> {
        if self.state != RequestState::Idle {
            return Ok(None);
        }
        if let Some(request) = &self.request {
            return Ok(Some(request.param_id));
        }

        match self.transport.poll_request()? {
            Some(request) => {
                debug!(tag = request.tag, param_id = request.param_id, "request received");
                let param_id = request.param_id;
                self.request = Some(request);
                Ok(Some(param_id))
            }
            None => Ok(None),
        }
    }

    /// Answer the received request for `param_id` through `service`.
    #[instrument(level = "debug", skip(self, service))]
    pub fn service_request<S: RequestService>(
        &mut self,
        param_id: u32,
        service: &mut S,
    ) -> Result<RequestState> {
        if self.state != RequestState::Idle {
            return Err(Error::fault(format!(
                "service requested while {:?}",
                self.state
            )));
        }
        let request = match &self.request {
            Some(request) if request.param_id == param_id => request,
            _ => {
                return Err(Error::fault(format!(
                    "no received request for parameter {param_id}"
                )))
            }
        };

        let outcome = match Param::from_id(param_id) {
            None => Err(NackReason::UnknownParameter(param_id)),
            Some(param) => {
                let mut area = ResponseArea::new(request.capacity);
                match service.respond(request, param, &mut area) {
                    Ok(()) => Ok(area.freeze()),
                    Err(Error::InvalidRequest(reason)) => Err(reason),
                    Err(e) => return Err(e),
                }
            }
        };

        let tag = request.tag;
        match outcome {
            Ok(payload) => {
                debug!(tag, len = payload.len(), "request serviced");
                self.reply = Some(IpcReply::Ack { tag, payload });
                self.state = RequestState::AckPending;
            }
            Err(reason) => {
                debug!(tag, %reason, "request refused");
                self.reply = Some(IpcReply::Nack { tag, reason });
                self.state = RequestState::NackPending;
            }
        }
        Ok(self.state)
    }

    /// Hand the pending reply to the transport.
    ///
    /// Returns [`Error::TransportBusy`] while the peer has not drained its
    /// previous message; call again later. The reply is delivered exactly
    /// once, after which the channel is idle.
    pub fn acknowledge(&mut self) -> Result<()> {
        let Some(reply) = self.reply.take() else {
            return Ok(());
        };

        let acked = reply.is_ack();
        match self.transport.try_deliver(reply) {
            Ok(()) => {
                trace!(state = ?self.state, "reply delivered");
                if acked {
                    metrics::counter!("ipc_acks").increment(1);
                } else {
                    metrics::counter!("ipc_nacks").increment(1);
                }
                self.state = RequestState::Idle;
                self.request = None;
                Ok(())
            }
            Err(DeliveryFailure::Busy(reply)) => {
                self.reply = Some(reply);
                metrics::counter!("ipc_ack_retries").increment(1);
                Err(Error::TransportBusy)
            }
            Err(DeliveryFailure::Disconnected) => {
                // The reply is gone with the peer
                self.state = RequestState::Idle;
                self.request = None;
                Err(Error::fault("user interface transport disconnected"))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::ipc::transport::{pair, FlumeTransport, PeerEndpoint};

    /// Answers every request with its tag, refuses `Threshold`
    #[derive(Default)]
    struct EchoService {
        calls: usize,
    }

    impl RequestService for EchoService {
        fn respond(&mut self, request: &IpcRequest, param: Param, area: &mut ResponseArea) -> Result<()> {
            self.calls += 1;
            if param == Param::Threshold {
                return Err(Error::InvalidRequest(NackReason::InvalidArgument(0)));
            }
            area.send_image(&request.tag.to_le_bytes(), 8)
        }
    }

    fn channel() -> (IpcRequestChannel<FlumeTransport>, PeerEndpoint) {
        let (transport, peer) = pair(1);
        (IpcRequestChannel::new(transport), peer)
    }

    #[test]
    fn test_idle_without_requests() {
        let (mut channel, _peer) = channel();
        assert_eq!(channel.check_for_request().unwrap(), None);
        assert_eq!(channel.state(), RequestState::Idle);
        channel.acknowledge().unwrap();
    }

    #[test]
    fn test_ack_round_trip() {
        let (mut channel, peer) = channel();
        peer.send(IpcRequest::get(5, Param::AppState, 64)).unwrap();

        let id = channel.check_for_request().unwrap().unwrap();
        assert_eq!(id, 0);
        let state = channel.service_request(id, &mut EchoService::default()).unwrap();
        assert_eq!(state, RequestState::AckPending);

        channel.acknowledge().unwrap();
        assert_eq!(channel.state(), RequestState::Idle);
        assert_eq!(
            peer.recv_timeout(Duration::from_millis(10)).unwrap(),
            IpcReply::Ack {
                tag: 5,
                payload: Bytes::copy_from_slice(&5u64.to_le_bytes())
            }
        );
    }

    #[test]
    fn test_unknown_parameter_is_nacked_without_service() {
        let (mut channel, peer) = channel();
        peer.send(IpcRequest {
            tag: 1,
            param_id: 4242,
            argument: 0,
            capacity: 64,
        })
        .unwrap();

        let id = channel.check_for_request().unwrap().unwrap();
        let mut service = EchoService::default();
        let state = channel.service_request(id, &mut service).unwrap();
        assert_eq!(state, RequestState::NackPending);
        assert_eq!(service.calls, 0);

        channel.acknowledge().unwrap();
        assert_eq!(
            peer.try_recv(),
            Some(IpcReply::Nack {
                tag: 1,
                reason: NackReason::UnknownParameter(4242)
            })
        );
    }

    #[test]
    fn test_oversized_payload_is_nacked() {
        let (mut channel, peer) = channel();
        peer.send(IpcRequest::get(3, Param::AppState, 4)).unwrap();
        let id = channel.check_for_request().unwrap().unwrap();
        channel.service_request(id, &mut EchoService::default()).unwrap();
        channel.acknowledge().unwrap();
        assert_eq!(
            peer.try_recv(),
            Some(IpcReply::Nack {
                tag: 3,
                reason: NackReason::PayloadTooLarge { len: 8, capacity: 4 }
            })
        );
    }

    #[test]
    fn test_no_new_request_while_pending() {
        let (mut channel, peer) = channel();
        peer.send(IpcRequest::get(1, Param::Threshold, 64)).unwrap();
        peer.send(IpcRequest::get(2, Param::AppState, 64)).unwrap();

        // Received but unserviced requests are reported again
        assert_eq!(channel.check_for_request().unwrap(), Some(16));
        assert_eq!(channel.check_for_request().unwrap(), Some(16));

        channel.service_request(16, &mut EchoService::default()).unwrap();
        assert_eq!(channel.state(), RequestState::NackPending);
        assert_eq!(channel.check_for_request().unwrap(), None);
        assert!(channel.service_request(0, &mut EchoService::default()).is_err());

        channel.acknowledge().unwrap();
        assert_eq!(channel.check_for_request().unwrap(), Some(0));
        assert_eq!(channel.pending_request().map(|r| r.tag), Some(2));
    }

    #[test]
    fn test_busy_acknowledge_delivers_exactly_once() {
        let (mut channel, peer) = channel();
        // Occupy the only reply slot
        channel
            .transport_mut()
            .try_deliver(IpcReply::Ack {
                tag: 0,
                payload: Bytes::new(),
            })
            .unwrap();

        peer.send(IpcRequest::get(9, Param::AppState, 64)).unwrap();
        let id = channel.check_for_request().unwrap().unwrap();
        channel.service_request(id, &mut EchoService::default()).unwrap();

        for _ in 0..5 {
            assert!(matches!(channel.acknowledge(), Err(Error::TransportBusy)));
            assert_eq!(channel.state(), RequestState::AckPending);
        }

        assert_eq!(peer.try_recv().map(|r| r.tag()), Some(0));
        channel.acknowledge().unwrap();
        assert_eq!(channel.state(), RequestState::Idle);
        channel.acknowledge().unwrap();

        assert_eq!(peer.try_recv().map(|r| r.tag()), Some(9));
        assert_eq!(peer.try_recv(), None);
    }

    #[test]
    fn test_disconnected_peer_is_fatal() {
        let (mut channel, peer) = channel();
        peer.send(IpcRequest::get(1, Param::AppState, 64)).unwrap();
        let id = channel.check_for_request().unwrap().unwrap();
        channel.service_request(id, &mut EchoService::default()).unwrap();
        drop(peer);
        assert!(matches!(
            channel.acknowledge(),
            Err(Error::UnrecoverableFault(_))
        ));
        assert_eq!(channel.state(), RequestState::Idle);
        channel.acknowledge().unwrap();
        assert_eq!(channel.check_for_request().unwrap(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Send(u32),
        Drain,
        Check,
        Service,
        Ack,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::sample::select(vec![0u32, 1, 3, 6, 16, 77]).prop_map(Op::Send),
            Just(Op::Drain),
            Just(Op::Check),
            Just(Op::Service),
            Just(Op::Ack),
        ]
    }

    proptest! {
        #[test]
        fn prop_single_slot_lifecycle(ops in prop::collection::vec(op(), 1..64)) {
            let (mut channel, peer) = channel();
            let mut service = EchoService::default();
            let mut next_tag = 0u64;
            let mut delivered = Vec::new();
            let mut current: Option<u32> = None;

            for op in ops {
                let before = channel.state();
                match op {
                    Op::Send(param_id) => {
                        next_tag += 1;
                        peer.send(IpcRequest { tag: next_tag, param_id, argument: 0, capacity: 8 }).unwrap();
                    }
                    Op::Drain => {
                        if let Some(reply) = peer.try_recv() {
                            delivered.push(reply.tag());
                        }
                    }
                    Op::Check => {
                        let got = channel.check_for_request().unwrap();
                        if before != RequestState::Idle {
                            prop_assert_eq!(got, None);
                        }
                        if got.is_some() {
                            current = got;
                        }
                    }
                    Op::Service => {
                        if let (RequestState::Idle, Some(id)) = (before, current) {
                            let state = channel.service_request(id, &mut service).unwrap();
                            prop_assert_ne!(state, RequestState::Idle);
                            current = None;
                        }
                    }
                    Op::Ack => match channel.acknowledge() {
                        Ok(()) => prop_assert_eq!(channel.state(), RequestState::Idle),
                        Err(Error::TransportBusy) => prop_assert_eq!(channel.state(), before),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    },
                }
            }

            // Replies arrive in request order, each at most once
            prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
