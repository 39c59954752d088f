//! Secure multi-node data replication

pub mod cipher;
pub mod codec;
pub mod manager;
pub mod redundancy;
pub mod transport;

pub use cipher::{PayloadCipher, PlainPayload, RsaOaepCipher};
pub use codec::{
    chunk_payload, decode_unit, digest, encode_unit, validate_data_transfer, verify_ack, DataUnit, DataUnitId,
    Endpoint,
};
pub use manager::{DataReplicationManager, ReplicationReport, ReplicationState};
pub use redundancy::{RedundancyManager, RedundancyReport};
pub use transport::{HttpsTransport, LoopbackTransport, ReplicationTransport, TransferAck, TransferRequest};
