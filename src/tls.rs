use crate::error::{Error, Result};
use base64::Engine;
use log::{debug, warn};
use pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// 不校验证书的校验器（信任由调用方通过公钥指纹另行保证）
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

/// 使用 webpki 根证书校验服务器证书的客户端配置
pub fn verified_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config_with_roots(roots)
}

/// 使用指定根证书的客户端配置
pub fn client_config_with_roots(roots: RootCertStore) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// 不校验证书的客户端配置
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// 把主机名转换为 TLS 服务器名，IP 也可以
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_matches(|c| c == '[' || c == ']');
    ServerName::try_from(host.to_string()).map_err(|e| Error::Tls(format!("非法服务器名 {:?}: {}", host, e)))
}

/// 受信任服务商的证书公钥指纹校验
///
/// 检查证书链中的第二张证书（签发者）。配置了指纹时要求 SPKI 的 SHA-256 命中其一；
/// 未配置指纹时要求签发者 CN 以 `issuer_prefix` 开头。两者都未配置时不做检查。
#[derive(Debug, Clone, Default)]
pub struct PinPolicy {
    pins: Vec<[u8; 32]>,
    issuer_prefix: Option<String>,
}

impl PinPolicy {
    /// `pins` 为 base64 编码的 SPKI SHA-256
    pub fn new(pins: &[String], issuer_prefix: Option<String>) -> Result<Self> {
        let mut decoded = Vec::with_capacity(pins.len());
        for pin in pins {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(pin.trim())
                .map_err(|e| Error::Config(format!("非法的证书指纹 {:?}: {}", pin, e)))?;
            let pin: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::Config("证书指纹长度必须为 32 字节".to_string()))?;
            decoded.push(pin);
        }
        Ok(Self {
            pins: decoded,
            issuer_prefix: issuer_prefix.filter(|p| !p.is_empty()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty() && self.issuer_prefix.is_none()
    }

    /// 校验对端证书链，失败时返回原因
    pub fn check(&self, certs: &[CertificateDer<'_>]) -> std::result::Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }
        let issuer = certs
            .get(1)
            .ok_or_else(|| format!("证书链长度 {} 不足", certs.len()))?;
        let fields = parse_certificate(issuer.as_ref()).ok_or("无法解析签发者证书")?;

        if !self.pins.is_empty() {
            let digest: [u8; 32] = Sha256::digest(fields.spki).into();
            if self.pins.iter().any(|pin| *pin == digest) {
                return Ok(());
            }
            return Err(format!(
                "签发者公钥指纹不匹配: {}",
                base64::engine::general_purpose::STANDARD.encode(digest)
            ));
        }

        match (&self.issuer_prefix, fields.common_name()) {
            (Some(prefix), Some(cn)) if cn.starts_with(prefix.as_str()) => Ok(()),
            (_, cn) => Err(format!("签发者 CN 不匹配: {:?}", cn)),
        }
    }
}

/// 计算证书 SPKI 的 SHA-256（base64），便于生成配置
pub fn spki_sha256_base64(cert_der: &[u8]) -> Option<String> {
    let fields = parse_certificate(cert_der)?;
    Some(base64::engine::general_purpose::STANDARD.encode(Sha256::digest(fields.spki)))
}

/// 从 PEM 文件加载服务端 TLS 配置（用于终结客户端 TLS）
pub fn load_server_config<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Arc<ServerConfig>> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let mut key_reader = BufReader::new(File::open(key_path)?);
    let config = server_config_from_pem(&mut cert_reader, &mut key_reader)?;
    debug!("加载证书 {} / {}", cert_path.display(), key_path.display());
    Ok(config)
}

/// 从 PEM 内容构造服务端 TLS 配置
pub fn server_config_from_pem(
    cert_pem: &mut dyn std::io::BufRead,
    key_pem: &mut dyn std::io::BufRead,
) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(cert_pem).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Tls("证书文件中没有证书".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(key_pem)?
        .ok_or_else(|| Error::Tls("私钥文件中没有私钥".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// 证书中需要的字段
struct CertFields<'a> {
    /// 主题 Name 的内容
    subject: &'a [u8],
    /// 完整的 SubjectPublicKeyInfo（含 DER 头）
    spki: &'a [u8],
}

impl CertFields<'_> {
    /// 主题中的 CommonName（OID 2.5.4.3）
    fn common_name(&self) -> Option<String> {
        const CN_OID: &[u8] = &[0x55, 0x04, 0x03];

        let mut rdns = self.subject;
        while let Some((set, rest)) = read_tlv(rdns) {
            rdns = rest;
            let mut attrs = set.content;
            while let Some((attr, rest)) = read_tlv(attrs) {
                attrs = rest;
                let (oid, value) = read_tlv(attr.content)?;
                if oid.tag == 0x06 && oid.content == CN_OID {
                    let (value, _) = read_tlv(value)?;
                    return Some(String::from_utf8_lossy(value.content).into_owned());
                }
            }
        }
        None
    }
}

/// 一个 DER 元素
struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
}

/// 读取一个 DER 元素，返回它和剩余数据
fn read_tlv(data: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let tag = *data.first()?;
    let first = *data.get(1)?;
    let (len, header) = if first & 0x80 == 0 {
        (first as usize, 2)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return None;
        }
        let bytes = data.get(2..2 + n)?;
        let len = bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, 2 + n)
    };
    let end = header.checked_add(len)?;
    let raw = data.get(..end)?;
    Some((
        Tlv {
            tag,
            content: &raw[header..],
            raw,
        },
        &data[end..],
    ))
}

/// 按 X.509 结构取出主题和公钥信息
fn parse_certificate(der: &[u8]) -> Option<CertFields<'_>> {
    const SEQUENCE: u8 = 0x30;

    let (cert, _) = read_tlv(der)?;
    if cert.tag != SEQUENCE {
        return None;
    }
    let (tbs, _) = read_tlv(cert.content)?;
    if tbs.tag != SEQUENCE {
        return None;
    }

    let mut fields = tbs.content;
    let (first, rest) = read_tlv(fields)?;
    // 可选的 [0] version
    if first.tag == 0xa0 {
        fields = rest;
    }

    // serialNumber, signature, issuer, validity, subject, subjectPublicKeyInfo
    let mut items = Vec::with_capacity(6);
    for _ in 0..6 {
        let (item, rest) = read_tlv(fields)?;
        items.push(item);
        fields = rest;
    }
    let spki = items.pop()?;
    let subject = items.pop()?;
    if spki.tag != SEQUENCE || subject.tag != SEQUENCE {
        warn!("证书结构异常");
        return None;
    }

    Some(CertFields {
        subject: subject.content,
        spki: spki.raw,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CHAIN_PEM: &str = include_str!("../testdata/chain.pem");
    pub(crate) const LEAF_KEY_PEM: &str = include_str!("../testdata/leaf.key");
    pub(crate) const CA_PEM: &str = include_str!("../testdata/ca.pem");
    /// testdata/ca.pem 的 SPKI SHA-256
    pub(crate) const CA_PIN: &str = "7zzc9x0Wz9zuQpPP6TSBK2Lxmds3dh4nEY4e41Wku4M=";

    pub(crate) fn chain() -> Vec<CertificateDer<'static>> {
        rustls_pemfile::certs(&mut CHAIN_PEM.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    pub(crate) fn test_server_config() -> Arc<ServerConfig> {
        server_config_from_pem(&mut CHAIN_PEM.as_bytes(), &mut LEAF_KEY_PEM.as_bytes()).unwrap()
    }

    pub(crate) fn test_roots() -> RootCertStore {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut CA_PEM.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        roots
    }

    #[test]
    fn test_parse_certificate() {
        let certs = chain();
        assert_eq!(certs.len(), 2);

        let leaf = parse_certificate(certs[0].as_ref()).unwrap();
        assert_eq!(leaf.common_name().as_deref(), Some("localhost"));

        let ca = parse_certificate(certs[1].as_ref()).unwrap();
        assert_eq!(ca.common_name().as_deref(), Some("Multipath Test CA"));
        assert_eq!(spki_sha256_base64(certs[1].as_ref()).as_deref(), Some(CA_PIN));
    }

    #[test]
    fn test_pin_policy() {
        let certs = chain();

        let policy = PinPolicy::new(&[CA_PIN.to_string()], None).unwrap();
        assert!(policy.check(&certs).is_ok());
        // 只有叶子证书时无法校验
        assert!(policy.check(&certs[..1]).is_err());

        let wrong = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let policy = PinPolicy::new(&[wrong], None).unwrap();
        assert!(policy.check(&certs).is_err());

        let policy = PinPolicy::new(&[], Some("Multipath ".to_string())).unwrap();
        assert!(policy.check(&certs).is_ok());
        let policy = PinPolicy::new(&[], Some("Google ".to_string())).unwrap();
        assert!(policy.check(&certs).is_err());

        assert!(PinPolicy::default().check(&[]).is_ok());
        assert!(PinPolicy::new(&["not base64!".to_string()], None).is_err());
    }

    #[test]
    fn test_read_tlv_rejects_truncated() {
        assert!(read_tlv(&[0x30]).is_none());
        assert!(read_tlv(&[0x30, 0x05, 0x01]).is_none());
        assert!(read_tlv(&[0x30, 0x81]).is_none());
        let (tlv, rest) = read_tlv(&[0x04, 0x01, 0xff, 0x00]).unwrap();
        assert_eq!(tlv.content, &[0xff]);
        assert_eq!(rest, &[0x00]);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("bad name").is_err());
        let _ = test_server_config();
        let _ = insecure_client_config();
        let _ = client_config_with_roots(test_roots());
    }
}
