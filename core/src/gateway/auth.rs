//! Authentication mode evaluation, tried in order until one applies.

use crate::config::AuthConfig;
use crate::error::{CoreError, Result};
use crate::gateway::connection::DeviceIdentity;
use crate::util::now_ms;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use subtle::ConstantTimeEq;

const CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// Information about the physical connection, gathered before the
/// handshake frame is parsed.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub is_loopback: bool,
    pub host_header: Option<String>,
    pub forwarded_for: Option<String>,
    pub direct_peer_is_trusted_proxy: bool,
    pub tailscale_user: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Principal {
    LocalBypass,
    TailscaleUser(String),
    Device { device_id: String },
    SharedSecret,
}

/// Evaluate authentication modes in priority order; the first applicable
/// mode decides the outcome.
pub fn authenticate(
    peer: &PeerInfo,
    tailscale_enabled: bool,
    device: Option<&DeviceIdentity>,
    challenge_nonce: &[u8],
    token: Option<&str>,
    password: Option<&str>,
    config: &AuthConfig,
) -> Result<Principal> {
    if peer.is_loopback
        && matches!(peer.host_header.as_deref(), Some("localhost") | Some("127.0.0.1"))
        && (peer.forwarded_for.is_none() || peer.direct_peer_is_trusted_proxy)
    {
        return Ok(Principal::LocalBypass);
    }

    if tailscale_enabled {
        if let Some(user) = &peer.tailscale_user {
            return Ok(Principal::TailscaleUser(user.clone()));
        }
    }

    if let Some(device) = device {
        return authenticate_device(device, challenge_nonce, config);
    }

    if let Some(presented) = token {
        if let Some(expected) = &config.token {
            if constant_time_eq(presented, expected) {
                return Ok(Principal::SharedSecret);
            }
        }
    }
    if let Some(presented) = password {
        if let Some(expected) = &config.password {
            if constant_time_eq(presented, expected) {
                return Ok(Principal::SharedSecret);
            }
        }
    }

    Err(CoreError::Unauthorized {
        message: "no authentication mode matched".into(),
    })
}

fn authenticate_device(
    device: &DeviceIdentity,
    challenge_nonce: &[u8],
    config: &AuthConfig,
) -> Result<Principal> {
    if device.token != hex::encode(challenge_nonce) {
        return Err(CoreError::Unauthorized {
            message: "device token does not match challenge nonce".into(),
        });
    }

    let skew = (now_ms() - device.signed_at_ms).abs();
    if skew > CLOCK_SKEW_MS {
        return Err(CoreError::Unauthorized {
            message: "device signature timestamp outside clock skew window".into(),
        });
    }

    let key_hex = config
        .device_keys
        .get(&device.device_id)
        .ok_or_else(|| CoreError::Unauthorized {
            message: format!("unknown device {}", device.device_id),
        })?;
    let key_bytes: [u8; 32] = hex::decode(key_hex)
        .map_err(|_| CoreError::Unauthorized {
            message: "malformed device public key".into(),
        })?
        .try_into()
        .map_err(|_| CoreError::Unauthorized {
            message: "device public key must be 32 bytes".into(),
        })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CoreError::Unauthorized {
        message: "invalid device public key".into(),
    })?;

    let sig_bytes: [u8; 64] = hex::decode(&device.signature)
        .map_err(|_| CoreError::Unauthorized {
            message: "malformed device signature".into(),
        })?
        .try_into()
        .map_err(|_| CoreError::Unauthorized {
            message: "device signature must be 64 bytes".into(),
        })?;
    let signature = Signature::from_bytes(&sig_bytes);

    let signed_payload = format!(
        "{}:{}:{}:{}:{}",
        device.device_id, device.client_id, device.role, device.signed_at_ms, device.token
    );
    verifying_key
        .verify(signed_payload.as_bytes(), &signature)
        .map_err(|_| CoreError::Unauthorized {
            message: "device signature verification failed".into(),
        })?;

    Ok(Principal::Device {
        device_id: device.device_id.clone(),
    })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
