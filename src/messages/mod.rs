//! Wire formats.
//!
//! Two planes, two codecs. The request/reply control plane between
//! clients and Discovery uses a compact binary envelope
//! ([`envelope::DiscoveryRequest`] / [`envelope::DiscoveryResponse`]).
//! The data plane and the Discovery sync channel use topic-prefixed
//! UTF-8 frames with JSON payloads ([`payload`]), so that prefix
//! filtering works on raw bytes without decoding.

pub mod envelope;
pub mod payload;

pub use envelope::{
  DiscoveryRequest, DiscoveryResponse, IsReadyReq, IsReadyResp, LookupReq, LookupResp,
  ReadyAccumulator, RegisterReq, RegisterResp, RegistrantInfo, RequestBody, Requester,
  ResponseBody, Role, Status,
};
pub use payload::{
  decode_publication, decode_sync, encode_publication, encode_sync, DirectorySnapshot,
  EndpointRef, MembershipDelta, MembershipKind, SampleRecord, SyncFrame,
};
