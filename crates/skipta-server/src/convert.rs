//! Mappings between domain types/errors and the gRPC surface.

use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

use skipta_proto::v1 as pb;
use skipta_types::{LastOp, OpReply, SkiptaError};

pub fn error_to_status(err: SkiptaError) -> Status {
    match &err {
        SkiptaError::NoKey => Status::not_found(err.to_string()),
        SkiptaError::WrongGroup => Status::failed_precondition(err.to_string()),
        SkiptaError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(addr) = leader {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert("skipta-leader-addr", val);
                }
            }
            status
        }
        SkiptaError::Timeout => Status::deadline_exceeded(err.to_string()),
        SkiptaError::NotReady => Status::aborted(err.to_string()),
        SkiptaError::Transport(_) | SkiptaError::Consensus(_) => Status::internal(err.to_string()),
    }
}

/// Inverse of [`error_to_status`], used on the client side of peer and
/// controller calls.
pub fn status_to_error(status: Status) -> SkiptaError {
    match status.code() {
        Code::NotFound => SkiptaError::NoKey,
        Code::FailedPrecondition => SkiptaError::WrongGroup,
        Code::Unavailable => SkiptaError::NotLeader {
            leader: status
                .metadata()
                .get("skipta-leader-addr")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        },
        Code::DeadlineExceeded => SkiptaError::Timeout,
        Code::Aborted => SkiptaError::NotReady,
        _ => SkiptaError::Transport(status.to_string()),
    }
}

pub fn reply_to_proto(reply: &OpReply) -> pb::OpReply {
    let (kind, value) = match reply {
        OpReply::Value(v) => (pb::ReplyKind::Value, v.clone()),
        OpReply::NoKey => (pb::ReplyKind::NoKey, String::new()),
        OpReply::Done => (pb::ReplyKind::Done, String::new()),
        OpReply::WrongGroup => (pb::ReplyKind::WrongGroup, String::new()),
    };
    pb::OpReply { kind: kind as i32, value }
}

pub fn reply_from_proto(reply: pb::OpReply) -> OpReply {
    match pb::ReplyKind::try_from(reply.kind).unwrap_or(pb::ReplyKind::Done) {
        pb::ReplyKind::Value => OpReply::Value(reply.value),
        pb::ReplyKind::NoKey => OpReply::NoKey,
        pb::ReplyKind::WrongGroup => OpReply::WrongGroup,
        pb::ReplyKind::Done | pb::ReplyKind::Unspecified => OpReply::Done,
    }
}

pub fn last_op_to_proto(op: &LastOp) -> pb::LastOp {
    pb::LastOp {
        request_id: op.request_id,
        reply: Some(reply_to_proto(&op.reply)),
    }
}

pub fn last_op_from_proto(op: pb::LastOp) -> LastOp {
    LastOp {
        request_id: op.request_id,
        reply: op.reply.map(reply_from_proto).unwrap_or(OpReply::Done),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_round_trips() {
        for reply in [
            OpReply::Value("v".into()),
            OpReply::NoKey,
            OpReply::Done,
            OpReply::WrongGroup,
        ] {
            assert_eq!(reply_from_proto(reply_to_proto(&reply)), reply);
        }
    }

    #[test]
    fn leader_hint_travels_in_metadata() {
        let status = error_to_status(SkiptaError::NotLeader {
            leader: Some("10.0.0.7:17000".into()),
        });
        assert_eq!(status.code(), Code::Unavailable);

        match status_to_error(status) {
            SkiptaError::NotLeader { leader } => {
                assert_eq!(leader.as_deref(), Some("10.0.0.7:17000"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn errors_keep_their_identity_across_the_wire() {
        for err in [
            SkiptaError::NoKey,
            SkiptaError::WrongGroup,
            SkiptaError::Timeout,
            SkiptaError::NotReady,
        ] {
            assert_eq!(status_to_error(error_to_status(err.clone())), err);
        }
    }
}
