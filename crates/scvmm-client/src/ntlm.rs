//! NTLMv2 authentication messages
//!
//! The three-message NTLM exchange WinRM accepts under the `Negotiate`
//! HTTP scheme: NEGOTIATE from the client, CHALLENGE from the server and
//! AUTHENTICATE answering it with an NTLMv2 response. Only authentication
//! is done here; messages are not signed or sealed, so plain HTTP needs
//! `AllowUnencrypted` on the WinRM listener.

use crate::error::ScvmmError;
use chrono::Utc;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use uuid::Uuid;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and the unix epoch
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Account used for the exchange
///
/// `DOMAIN\user` is split into its parts; `user@domain` is sent whole as
/// the user name with an empty domain.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        let (domain, user) = username.split_once('\\').unwrap_or(("", username));
        Self {
            domain: domain.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

/// Values taken from the server's CHALLENGE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    /// MsvAvTimestamp from the target info, as a FILETIME
    fn timestamp(&self) -> Option<u64> {
        let mut rest = self.target_info.as_slice();
        while rest.len() >= 4 {
            let id = u16::from_le_bytes([rest[0], rest[1]]);
            let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
            let value = rest.get(4..4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP => return value.try_into().ok().map(u64::from_le_bytes),
                _ => rest = &rest[4 + len..],
            }
        }
        None
    }
}

/// NEGOTIATE message opening the exchange
pub fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(32);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    // Empty domain and workstation buffers
    message.extend_from_slice(&[0u8; 16]);
    message
}

/// Decode a CHALLENGE message
pub fn parse_challenge(message: &[u8]) -> Result<Challenge, ScvmmError> {
    let invalid = |what: &str| ScvmmError::Transport(format!("invalid NTLM challenge: {what}"));

    if message.len() < 32 || &message[..8] != SIGNATURE {
        return Err(invalid("missing NTLMSSP signature"));
    }
    if read_u32(message, 8) != Some(2) {
        return Err(invalid("not a CHALLENGE message"));
    }
    let flags = read_u32(message, 20).ok_or_else(|| invalid("truncated flags"))?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&message[24..32]);

    let target_info = if message.len() >= 48 {
        let len = usize::from(read_u16(message, 40).ok_or_else(|| invalid("truncated target info"))?);
        let offset = read_u32(message, 44).ok_or_else(|| invalid("truncated target info"))? as usize;
        message
            .get(offset..offset + len)
            .ok_or_else(|| invalid("target info out of bounds"))?
            .to_vec()
    } else {
        Vec::new()
    };

    Ok(Challenge {
        flags,
        server_challenge,
        target_info,
    })
}

/// AUTHENTICATE message answering `challenge`
pub fn authenticate_message(
    credentials: &Credentials,
    challenge: &Challenge,
    workstation: &str,
) -> Result<Vec<u8>, ScvmmError> {
    let mut client_challenge = [0u8; 8];
    client_challenge.copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);

    let key = ntowf_v2(credentials)?;
    let (timestamp, lm_response) = match challenge.timestamp() {
        // A server timestamp means the LM response is sent zeroed
        Some(timestamp) => (timestamp, vec![0u8; 24]),
        None => (
            filetime_now(),
            lm_response_v2(&key, &challenge.server_challenge, &client_challenge)?,
        ),
    };
    let nt_response = nt_response(&key, challenge, &client_challenge, timestamp)?;

    let flags = (challenge.flags & NEGOTIATE_FLAGS) | NEGOTIATE_UNICODE;
    Ok(assemble_authenticate(
        flags,
        &lm_response,
        &nt_response,
        &utf16le(&credentials.domain),
        &utf16le(&credentials.user),
        &utf16le(workstation),
    ))
}

fn assemble_authenticate(
    flags: u32,
    lm_response: &[u8],
    nt_response: &[u8],
    domain: &[u8],
    user: &[u8],
    workstation: &[u8],
) -> Vec<u8> {
    const HEADER_LEN: usize = 64;
    let fields: [&[u8]; 6] = [lm_response, nt_response, domain, user, workstation, &[]];

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(SIGNATURE);
    header.extend_from_slice(&3u32.to_le_bytes());

    let mut payload = Vec::new();
    for field in fields {
        let len = field.len() as u16;
        let offset = (HEADER_LEN + payload.len()) as u32;
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(field);
    }
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend(payload);
    header
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over UPPER(user) + domain
fn ntowf_v2(credentials: &Credentials) -> Result<Vec<u8>, ScvmmError> {
    let nt_hash = Md4::digest(utf16le(&credentials.password));
    let identity = format!("{}{}", credentials.user.to_uppercase(), credentials.domain);
    hmac_md5(&nt_hash, &[&utf16le(&identity)])
}

/// NTProofStr followed by the client blob it covers
fn nt_response(
    key: &[u8],
    challenge: &Challenge,
    client_challenge: &[u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>, ScvmmError> {
    let mut blob = vec![0x01, 0x01, 0, 0, 0, 0, 0, 0];
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&challenge.target_info);
    blob.extend_from_slice(&[0u8; 4]);

    let mut response = hmac_md5(key, &[&challenge.server_challenge, &blob])?;
    response.extend(blob);
    Ok(response)
}

fn lm_response_v2(key: &[u8], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Result<Vec<u8>, ScvmmError> {
    let mut response = hmac_md5(key, &[server_challenge, client_challenge])?;
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, ScvmmError> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key)
        .map_err(|e| ScvmmError::Transport(format!("NTLM key error: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn filetime_now() -> u64 {
    let now = Utc::now();
    let secs = u64::try_from(now.timestamp() + FILETIME_EPOCH_OFFSET).unwrap_or_default();
    secs * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2)?.try_into().ok().map(u16::from_le_bytes)
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

/// CHALLENGE message as a server would send it
#[cfg(test)]
pub(crate) fn challenge_message(server_challenge: [u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&2u32.to_le_bytes());
    // Empty target name at offset 48
    message.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
    message.extend_from_slice(&0xE28A_8235u32.to_le_bytes());
    message.extend_from_slice(&server_challenge);
    message.extend_from_slice(&[0u8; 8]);
    let len = target_info.len() as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&48u32.to_le_bytes());
    message.extend_from_slice(target_info);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Target info holding NbDomainName "Domain" and NbComputerName "Server"
    fn sample_target_info() -> Vec<u8> {
        let mut info = Vec::new();
        for (id, value) in [(2u16, "Domain"), (1u16, "Server")] {
            let value = utf16le(value);
            info.extend_from_slice(&id.to_le_bytes());
            info.extend_from_slice(&(value.len() as u16).to_le_bytes());
            info.extend(value);
        }
        info.extend_from_slice(&[0u8; 4]);
        info
    }

    fn sample_credentials() -> Credentials {
        Credentials::new("Domain\\User", "Password")
    }

    #[test]
    fn test_credentials_split_domain() {
        let credentials = Credentials::new("CORP\\svc-capi", "pw");
        assert_eq!(credentials.domain, "CORP");
        assert_eq!(credentials.user, "svc-capi");

        let upn = Credentials::new("svc-capi@corp.example.com", "pw");
        assert_eq!(upn.domain, "");
        assert_eq!(upn.user, "svc-capi@corp.example.com");
        assert!(!format!("{upn:?}").contains("pw"));
    }

    #[test]
    fn test_negotiate_message_layout() {
        let message = negotiate_message();
        assert_eq!(&message[..8], b"NTLMSSP\0");
        assert_eq!(read_u32(&message, 8), Some(1));
        assert_eq!(read_u32(&message, 12), Some(0xA008_8207));
        assert_eq!(message.len(), 32);
    }

    #[test]
    fn test_parse_challenge() {
        let target_info = sample_target_info();
        let message = challenge_message([1, 2, 3, 4, 5, 6, 7, 8], &target_info);
        let challenge = parse_challenge(&message).unwrap();
        assert_eq!(challenge.server_challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(challenge.target_info, target_info);
        assert_eq!(challenge.timestamp(), None);

        assert!(parse_challenge(b"NTLMSSP\0").is_err());
        assert!(parse_challenge(&negotiate_message()).is_err());
    }

    #[test]
    fn test_challenge_timestamp() {
        let mut info = Vec::new();
        info.extend_from_slice(&AV_TIMESTAMP.to_le_bytes());
        info.extend_from_slice(&8u16.to_le_bytes());
        info.extend_from_slice(&0x01D9_0000_1234_5678u64.to_le_bytes());
        info.extend_from_slice(&[0u8; 4]);
        let challenge = parse_challenge(&challenge_message([0; 8], &info)).unwrap();
        assert_eq!(challenge.timestamp(), Some(0x01D9_0000_1234_5678));
    }

    // Values from the NTLMv2 worked example in MS-NLMP
    #[test]
    fn test_ntlmv2_known_values() {
        let key = ntowf_v2(&sample_credentials()).unwrap();
        assert_eq!(hex(&key), "0c868a403bfd7a93a3001ef22ef02e3f");

        let challenge = Challenge {
            flags: 0,
            server_challenge: [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
            target_info: sample_target_info(),
        };
        let client_challenge = [0xaa; 8];

        let nt = nt_response(&key, &challenge, &client_challenge, 0).unwrap();
        assert_eq!(hex(&nt[..16]), "68cd0ab851e51c96aabc927bebef6a1c");

        let lm = lm_response_v2(&key, &challenge.server_challenge, &client_challenge).unwrap();
        assert_eq!(hex(&lm), "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_authenticate_message_layout() {
        let challenge = parse_challenge(&challenge_message([9; 8], &sample_target_info())).unwrap();
        let message = authenticate_message(&sample_credentials(), &challenge, "CAPI").unwrap();

        assert_eq!(&message[..8], b"NTLMSSP\0");
        assert_eq!(read_u32(&message, 8), Some(3));

        let field = |at: usize| {
            let len = usize::from(read_u16(&message, at).unwrap());
            let offset = read_u32(&message, at + 4).unwrap() as usize;
            message[offset..offset + len].to_vec()
        };
        assert_eq!(field(12).len(), 24);
        // NTProofStr + fixed blob header + target info + trailing zeros
        assert_eq!(field(20).len(), 16 + 28 + sample_target_info().len() + 4);
        assert_eq!(field(28), utf16le("Domain"));
        assert_eq!(field(36), utf16le("User"));
        assert_eq!(field(44), utf16le("CAPI"));
        assert!(field(52).is_empty());
        assert_ne!(read_u32(&message, 60).unwrap() & NEGOTIATE_UNICODE, 0);
    }
}
