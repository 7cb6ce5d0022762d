//! Peer-facing gRPC ingress.
//!
//! Peers stream serialized consensus messages here. The handler only
//! classifies and enqueues; the loop thread does everything else, so a
//! slow disk or a busy loop never blocks the transport.

use pb::raft_service_server::RaftService;
use pb::{PostMessageRequest, PostMessageResponse, ResultCode};
use protobuf::Message;
use raft::prelude::{Message as RaftMessage, MessageType};
use std::sync::Arc;
use tokio_stream::StreamExt;

use crate::raft::request::{RaftReq, RequestQueue};

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

pub struct RaftServiceSVC {
    queue: Arc<RequestQueue>,
}

impl RaftServiceSVC {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        RaftServiceSVC { queue }
    }
}

/// Map a wire message onto the request type the loop dispatches on.
pub fn classify(msg: RaftMessage) -> RaftReq {
    let from = msg.from;
    match msg.get_msg_type() {
        MessageType::MsgRequestVote
        | MessageType::MsgRequestVoteResponse
        | MessageType::MsgRequestPreVote
        | MessageType::MsgRequestPreVoteResponse => RaftReq::RequestVote { from, msg },
        MessageType::MsgSnapshot if !msg.get_snapshot().get_data().is_empty() => {
            let meta = msg.get_snapshot().get_metadata();
            RaftReq::LoadSnapshot {
                term: meta.term,
                idx: meta.index,
                data: msg.get_snapshot().get_data().to_vec(),
                reply: None,
            }
        }
        _ => RaftReq::AppendEntries { from, msg },
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_message(
        &self,
        request: tonic::Request<tonic::Streaming<PostMessageRequest>>,
    ) -> Result<tonic::Response<PostMessageResponse>, tonic::Status> {
        let mut response = PostMessageResponse::default();
        let mut stream = request.into_inner();
        while let Some(item) = stream.next().await {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    log::warn!("peer stream error: {}", e);
                    break;
                }
            };
            for data in item.data {
                match RaftMessage::parse_from_bytes(data.as_slice()) {
                    Ok(message) => {
                        self.queue.submit(classify(message));
                        response.ret.push(ResultCode::Ok as i32);
                    }
                    Err(e) => {
                        log::warn!("undecodable peer message: {}", e);
                        response.ret.push(ResultCode::Fail as i32);
                    }
                }
            }
        }
        Ok(tonic::Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_type: MessageType) -> RaftMessage {
        let mut msg = RaftMessage::default();
        msg.set_msg_type(msg_type);
        msg.from = 2;
        msg
    }

    #[test]
    fn test_vote_messages_classified_separately() {
        for t in [
            MessageType::MsgRequestVote,
            MessageType::MsgRequestVoteResponse,
            MessageType::MsgRequestPreVote,
            MessageType::MsgRequestPreVoteResponse,
        ] {
            match classify(message(t)) {
                RaftReq::RequestVote { from, .. } => assert_eq!(from, 2),
                other => panic!("{:?} classified as {}", t, other.type_name()),
            }
        }
    }

    #[test]
    fn test_append_and_heartbeat_share_a_type() {
        for t in [
            MessageType::MsgAppend,
            MessageType::MsgAppendResponse,
            MessageType::MsgHeartbeat,
            MessageType::MsgHeartbeatResponse,
        ] {
            match classify(message(t)) {
                RaftReq::AppendEntries { from, .. } => assert_eq!(from, 2),
                other => panic!("{:?} classified as {}", t, other.type_name()),
            }
        }
    }

    #[test]
    fn test_snapshot_with_image_becomes_load_snapshot() {
        let mut msg = message(MessageType::MsgSnapshot);
        msg.mut_snapshot().mut_metadata().index = 7;
        msg.mut_snapshot().mut_metadata().term = 2;
        msg.mut_snapshot().data = vec![1, 2, 3].into();
        match classify(msg) {
            RaftReq::LoadSnapshot { term, idx, data, .. } => {
                assert_eq!((term, idx), (2, 7));
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("classified as {}", other.type_name()),
        }
    }

    #[test]
    fn test_metadata_only_snapshot_stays_on_append_path() {
        let mut msg = message(MessageType::MsgSnapshot);
        msg.mut_snapshot().mut_metadata().index = 1;
        match classify(msg) {
            RaftReq::AppendEntries { .. } => {}
            other => panic!("classified as {}", other.type_name()),
        }
    }
}
