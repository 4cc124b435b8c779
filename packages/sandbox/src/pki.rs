// ABOUTME: Per-user certificate authority and VPN client profile generation
// ABOUTME: Issues a CA and a client certificate, uploads OpenVPN profiles, returns CA material

use crate::clock::Clock;
use crate::objects::{object_key, ObjectStore, ObjectStoreError};
use crate::state::VpnMaterial;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

/// Certificates stay valid for ten years
const VALIDITY_DAYS: i64 = 3650;

/// Folder in object storage holding client profiles
pub const PROFILE_FOLDER: &str = "vpn";

const TLS_CRYPT_HEADER: &str = "-----BEGIN OpenVPN Static key V1-----";
const TLS_CRYPT_FOOTER: &str = "-----END OpenVPN Static key V1-----";

/// A 2048-bit OpenVPN static key, in hex
const TLS_CRYPT_HEX_LEN: usize = 512;

const LINUX_DIRECTIVES: &str = r#"script-security 2
up "/usr/bin/env sh -c 'ip link set $dev up || ifconfig $dev up'"
up-restart
"#;

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("Invalid certificate validity start: {0}")]
    InvalidTime(String),
    #[error("Invalid tls-crypt key: {0}")]
    InvalidTlsCryptKey(String),
    #[error("Unknown VPN platform: {0}")]
    UnknownPlatform(String),
    #[error("Failed to store client profile: {0}")]
    Storage(#[from] ObjectStoreError),
}

pub type Result<T> = std::result::Result<T, PkiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnPlatform {
    Windows,
    Linux,
}

impl VpnPlatform {
    pub const ALL: [VpnPlatform; 2] = [VpnPlatform::Windows, VpnPlatform::Linux];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "win",
            Self::Linux => "linux",
        }
    }

    fn directives(&self) -> &'static str {
        match self {
            Self::Windows => "",
            Self::Linux => LINUX_DIRECTIVES,
        }
    }
}

impl FromStr for VpnPlatform {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "win" | "windows" => Ok(Self::Windows),
            "linux" => Ok(Self::Linux),
            _ => Err(PkiError::UnknownPlatform(s.to_string())),
        }
    }
}

/// Object key of a user's client profile, e.g. `vpn/7/config-linux.ovpn`
pub fn profile_key(user_id: i64, platform: VpnPlatform) -> String {
    object_key(
        PROFILE_FOLDER,
        user_id,
        &format!("config-{}.ovpn", platform.as_str()),
    )
}

/// Pre-shared key embedded in every client profile.
///
/// Accepts the usual armoured block or bare hex, with or without line breaks,
/// and re-wraps it at 32 characters per line.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsCryptKey(String);

impl TlsCryptKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let hex: String = raw
            .replace(TLS_CRYPT_HEADER, "")
            .replace(TLS_CRYPT_FOOTER, "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        if hex.len() != TLS_CRYPT_HEX_LEN {
            return Err(PkiError::InvalidTlsCryptKey(format!(
                "expected {} hex characters, got {}",
                TLS_CRYPT_HEX_LEN,
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PkiError::InvalidTlsCryptKey(
                "key contains non-hex characters".to_string(),
            ));
        }

        let lines: Vec<&str> = (0..hex.len())
            .step_by(32)
            .map(|i| &hex[i..i + 32])
            .collect();

        Ok(Self(format!(
            "{}\n{}\n{}",
            TLS_CRYPT_HEADER,
            lines.join("\n"),
            TLS_CRYPT_FOOTER
        )))
    }

    pub fn as_block(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for TlsCryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsCryptKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct PkiConfig {
    /// Prefix of certificate common names, shared with container names
    pub namespace: String,
    /// Host the client profiles connect to
    pub vpn_host: String,
    pub organization: String,
    pub country: Option<String>,
    pub tls_crypt_key: TlsCryptKey,
}

/// PEM material of a freshly generated CA and the client certificate it signed
pub struct IssuedCredentials {
    pub ca_certificate_pem: String,
    pub ca_private_key_pem: String,
    pub client_certificate_pem: String,
    pub client_private_key_pem: String,
}

impl IssuedCredentials {
    /// What the gateway container gets: the CA, armour stripped, one line each
    pub fn vpn_material(&self) -> VpnMaterial {
        VpnMaterial {
            certificate: pem_body(&self.ca_certificate_pem),
            private_key: pem_body(&self.ca_private_key_pem),
        }
    }
}

/// Strip the BEGIN/END lines of a PEM block and join the base64 body into one line.
pub fn pem_body(pem: &str) -> String {
    let lines: Vec<&str> = pem.trim().lines().collect();
    if lines.len() < 2 {
        return String::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|line| line.trim())
        .collect()
}

pub struct PkiIssuer {
    config: PkiConfig,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl PkiIssuer {
    pub fn new(config: PkiConfig, objects: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            objects,
            clock,
        }
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    fn distinguished_name(&self, common_name: String) -> DistinguishedName {
        let mut name = DistinguishedName::new();
        if let Some(country) = &self.config.country {
            name.push(DnType::CountryName, country.as_str());
        }
        name.push(DnType::OrganizationName, self.config.organization.as_str());
        name.push(DnType::CommonName, common_name.as_str());
        name
    }

    fn base_params(&self, common_name: String) -> Result<CertificateParams> {
        let now = self.clock.now();
        let not_before = OffsetDateTime::from_unix_timestamp(now.timestamp())
            .map_err(|e| PkiError::InvalidTime(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.distinguished_name = self.distinguished_name(common_name);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(VALIDITY_DAYS);
        Ok(params)
    }

    /// Generate a new CA and a client certificate signed by it.
    pub fn generate(&self, user_id: i64) -> Result<IssuedCredentials> {
        let prefix = format!("{}-{}", self.config.namespace, user_id);

        let mut ca_params = self.base_params(format!("{}-server", prefix))?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = Certificate::from_params(ca_params)?;

        let mut client_params = self.base_params(format!("{}-client", prefix))?;
        client_params.use_authority_key_identifier_extension = true;
        client_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = Certificate::from_params(client_params)?;

        Ok(IssuedCredentials {
            ca_certificate_pem: ca.serialize_pem()?,
            ca_private_key_pem: ca.serialize_private_key_pem(),
            client_certificate_pem: client.serialize_pem_with_signer(&ca)?,
            client_private_key_pem: client.serialize_private_key_pem(),
        })
    }

    /// OpenVPN client profile for one platform, with all credentials inlined
    pub fn render_profile(
        &self,
        credentials: &IssuedCredentials,
        port: i64,
        platform: VpnPlatform,
    ) -> String {
        format!(
            r#"client
dev tap
proto tcp
remote {host} {port}

nobind

cipher AES-256-GCM
auth SHA256
key-direction 1

{directives}
verb 3

<ca>
{ca}
</ca>

<cert>
{cert}
</cert>

<key>
{key}
</key>

<tls-crypt>
{tls_crypt}
</tls-crypt>
"#,
            host = self.config.vpn_host,
            port = port,
            directives = platform.directives(),
            ca = credentials.ca_certificate_pem.trim(),
            cert = credentials.client_certificate_pem.trim(),
            key = credentials.client_private_key_pem.trim(),
            tls_crypt = self.config.tls_crypt_key.as_block(),
        )
    }

    /// Issue credentials for a user and publish their client profiles.
    ///
    /// Every call creates a brand new CA. Callers must only issue for records
    /// without VPN material, otherwise downloaded profiles stop working.
    pub async fn issue(&self, user_id: i64, port: i64) -> Result<VpnMaterial> {
        let credentials = self.generate(user_id)?;

        for platform in VpnPlatform::ALL {
            let profile = self.render_profile(&credentials, port, platform);
            self.objects
                .upload_bytes(&profile_key(user_id, platform), profile.into_bytes())
                .await?;
        }

        info!("Issued VPN credentials for user {} on port {}", user_id, port);
        Ok(credentials.vpn_material())
    }
}
