//! MTOM/XOP decoding: multipart/related splitting plus resolution of
//! `xop:Include` references from the SOAP root part to binary attachments.

pub mod multipart;
pub mod xop;

pub use multipart::{parse_multipart, MimeError, MimePart, MultipartBody};
pub use xop::{decode_mtom, DecodedShipment, DocumentPart};
