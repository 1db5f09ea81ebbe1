//! Building certificate requests and certificates for device held keys.
//!
//! The private key never leaves the device, so the to-be-signed parts are
//! encoded here and only the signature is produced by the device.

use std::fmt;
use bcder::{BitString, Captured, Mode, OctetString, Oid, Tag};
use bcder::encode;
use bcder::encode::{Constructed, PrimitiveContent, Values};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use openssl::x509::{X509, X509Req};
use crate::api::token::{CertRequestFormat, KeyUsage};
use super::error::DeviceError;
use super::mechanism::SignAlgorithm;


//------------ Object Identifiers --------------------------------------------

const COMMON_NAME: Oid<&[u8]> = Oid(&[85, 4, 3]);
const SERIAL_NUMBER: Oid<&[u8]> = Oid(&[85, 4, 5]);
const COUNTRY: Oid<&[u8]> = Oid(&[85, 4, 6]);
const LOCALITY: Oid<&[u8]> = Oid(&[85, 4, 7]);
const STATE: Oid<&[u8]> = Oid(&[85, 4, 8]);
const ORGANIZATION: Oid<&[u8]> = Oid(&[85, 4, 10]);
const ORGANIZATIONAL_UNIT: Oid<&[u8]> = Oid(&[85, 4, 11]);
const CE_KEY_USAGE: Oid<&[u8]> = Oid(&[85, 29, 15]);

/// The empty `[0] IMPLICIT SET OF Attribute` of a certificate request.
const EMPTY_CSR_ATTRIBUTES: &[u8] = &[0xa0, 0x00];


//------------ DistinguishedName ---------------------------------------------

/// A distinguished name parsed from its `CN=..., O=...` string form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistinguishedName {
    rdns: Vec<(&'static str, String)>,
}

impl DistinguishedName {
    /// Parses a comma separated list of `TYPE=value` pairs.
    ///
    /// A backslash escapes a comma inside a value.
    pub fn parse(s: &str) -> Result<Self, DeviceError> {
        let mut rdns = Vec::new();
        for part in split_unescaped(s) {
            let part = part.trim();
            if part.is_empty() {
                continue
            }
            let (attr, value) = part.split_once('=').ok_or_else(|| {
                DeviceError::other(format!("invalid subject part '{part}'"))
            })?;
            let attr = Self::attribute(attr.trim()).ok_or_else(|| {
                DeviceError::other(format!(
                    "unsupported subject attribute '{}'", attr.trim()
                ))
            })?;
            let value = value.trim();
            if value.is_empty() {
                return Err(DeviceError::other(format!(
                    "empty value for subject attribute '{attr}'"
                )))
            }
            rdns.push((attr, value.to_string()));
        }
        if rdns.is_empty() {
            return Err(DeviceError::other("empty subject name"))
        }
        Ok(DistinguishedName { rdns })
    }

    pub fn common_name(cn: &str) -> Self {
        DistinguishedName { rdns: vec![("CN", cn.to_string())] }
    }

    fn attribute(attr: &str) -> Option<&'static str> {
        ["CN", "C", "O", "OU", "L", "ST", "serialNumber"]
            .into_iter()
            .find(|known| known.eq_ignore_ascii_case(attr))
    }

    fn oid(attr: &str) -> Oid<&'static [u8]> {
        match attr {
            "C" => COUNTRY,
            "O" => ORGANIZATION,
            "OU" => ORGANIZATIONAL_UNIT,
            "L" => LOCALITY,
            "ST" => STATE,
            "serialNumber" => SERIAL_NUMBER,
            _ => COMMON_NAME,
        }
    }

    /// Encodes the name as an X.501 Name.
    ///
    /// Each attribute becomes its own relative distinguished name.
    pub fn encode(&self) -> Captured {
        let rdns: Vec<Captured> = self.rdns.iter().map(|(attr, value)| {
            let tag = match *attr {
                "C" | "serialNumber" => Tag::PRINTABLE_STRING,
                _ => Tag::UTF8_STRING,
            };
            encode::set(
                encode::sequence((
                    Self::oid(attr).encode(),
                    OctetString::encode_slice_as(value.as_bytes(), tag),
                ))
            ).to_captured(Mode::Der)
        }).collect();
        encode::sequence(encode::iter(rdns.iter())).to_captured(Mode::Der)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, (attr, value)) in self.rdns.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", attr, value.replace(',', "\\,"))?;
        }
        Ok(())
    }
}

fn split_unescaped(s: &str) -> Vec<String> {
    let mut res = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => res.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    res.push(current);
    res
}


//------------ Raw DER helpers -----------------------------------------------

/// Captures a single DER encoded value so it can be embedded as is.
pub fn capture_der(der: &[u8]) -> Result<Captured, DeviceError> {
    Mode::Der.decode(Bytes::copy_from_slice(der), |cons| {
        cons.capture_one()
    }).map_err(|err| DeviceError::other(format!("invalid DER: {err}")))
}

/// Returns the DER encoded subject public key info of a certificate.
pub fn certificate_public_key(cert: &[u8]) -> Result<Bytes, DeviceError> {
    let cert = X509::from_der(cert)?;
    Ok(Bytes::from(cert.public_key()?.public_key_to_der()?))
}

/// Returns the DER encoded subject name of a certificate.
pub fn certificate_subject(cert: &[u8]) -> Result<Captured, DeviceError> {
    let cert = X509::from_der(cert)?;
    capture_der(&cert.subject_name().to_der()?)
}

/// Returns the first common name in the subject of a certificate.
pub fn certificate_common_name(
    cert: &[u8]
) -> Result<Option<String>, DeviceError> {
    let cert = X509::from_der(cert)?;
    let entry = cert.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next();
    match entry {
        Some(entry) => Ok(Some(entry.data().as_utf8()?.to_string())),
        None => Ok(None),
    }
}

fn algorithm_identifier(algorithm: SignAlgorithm) -> impl Values {
    encode::sequence((algorithm.oid().encode(), ().encode()))
}

fn encode_time(time: DateTime<Utc>) -> impl Values {
    if (1950..2050).contains(&time.year()) {
        OctetString::encode_slice_as(
            time.format("%y%m%d%H%M%SZ").to_string().into_bytes(),
            Tag::UTC_TIME,
        )
    }
    else {
        OctetString::encode_slice_as(
            time.format("%Y%m%d%H%M%SZ").to_string().into_bytes(),
            Tag::GENERALIZED_TIME,
        )
    }
}


//------------ CertRequest ---------------------------------------------------

/// A PKCS#10 certificate request for a device key.
pub struct CertRequest {
    subject: DistinguishedName,
    public_key: Captured,
}

impl CertRequest {
    pub fn new(
        subject: DistinguishedName,
        public_key: &[u8],
    ) -> Result<Self, DeviceError> {
        Ok(CertRequest { subject, public_key: capture_der(public_key)? })
    }

    fn encode_info(&self) -> Result<Captured, DeviceError> {
        Ok(encode::sequence((
            0u8.encode(),
            self.subject.encode(),
            &self.public_key,
            capture_der(EMPTY_CSR_ATTRIBUTES)?,
        )).to_captured(Mode::Der))
    }

    /// Creates the signed request in the given format.
    ///
    /// The closure receives the data to be signed and returns the
    /// signature.
    pub fn sign<F>(
        &self,
        algorithm: SignAlgorithm,
        format: CertRequestFormat,
        signer: F,
    ) -> Result<Bytes, DeviceError>
    where
        F: FnOnce(&[u8]) -> Result<Bytes, DeviceError>,
    {
        let info = self.encode_info()?;
        let signature = signer(info.as_slice())?;
        let der = encode::sequence((
            &info,
            algorithm_identifier(algorithm),
            BitString::new(0, signature).encode(),
        )).to_captured(Mode::Der).into_bytes();

        match format {
            CertRequestFormat::Der => Ok(der),
            CertRequestFormat::Pem => {
                let pem = X509Req::from_der(&der)?.to_pem()?;
                Ok(Bytes::from(pem))
            }
        }
    }
}


//------------ TbsCertificate ------------------------------------------------

/// The signed content part of an X.509 v3 certificate.
///
/// ```text
/// TBSCertificate  ::=  SEQUENCE  {
///     version         [0]  EXPLICIT Version DEFAULT v1,
///     serialNumber         CertificateSerialNumber,
///     signature            AlgorithmIdentifier,
///     issuer               Name,
///     validity             Validity,
///     subject              Name,
///     subjectPublicKeyInfo SubjectPublicKeyInfo,
///     extensions      [3]  EXPLICIT Extensions OPTIONAL }
/// ```
pub struct TbsCertificate {
    serial_number: u64,
    algorithm: SignAlgorithm,
    issuer: Captured,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: Captured,
    public_key: Captured,
    key_usage: Option<KeyUsage>,
}

impl TbsCertificate {
    pub fn new(
        algorithm: SignAlgorithm,
        issuer: Captured,
        subject: &DistinguishedName,
        public_key: &[u8],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, DeviceError> {
        if not_after <= not_before {
            return Err(DeviceError::other(
                "certificate validity ends before it starts"
            ))
        }
        Ok(TbsCertificate {
            // Keep the top bit clear so the serial stays positive and
            // short.
            serial_number: rand::random::<u64>() >> 1,
            algorithm,
            issuer,
            not_before,
            not_after,
            subject: subject.encode(),
            public_key: capture_der(public_key)?,
            key_usage: None,
        })
    }

    /// Adds a critical key usage extension matching the key's usage.
    pub fn with_key_usage(mut self, usage: KeyUsage) -> Self {
        self.key_usage = Some(usage);
        self
    }

    fn encode_key_usage(usage: KeyUsage) -> Captured {
        // digitalSignature and nonRepudiation for signing keys,
        // digitalSignature and keyEncipherment for authentication keys.
        let bits = match usage {
            KeyUsage::Signing => BitString::new(6, Bytes::from_static(&[0xc0])),
            KeyUsage::Authentication => {
                BitString::new(5, Bytes::from_static(&[0xa0]))
            }
        };
        let value = bits.encode().to_captured(Mode::Der).into_bytes();
        Constructed::new(
            Tag::CTX_3,
            encode::sequence(
                encode::sequence((
                    CE_KEY_USAGE.encode(),
                    true.encode(),
                    OctetString::new(value).encode(),
                ))
            )
        ).to_captured(Mode::Der)
    }

    fn encode(&self) -> Captured {
        encode::sequence((
            (
                Constructed::new(Tag::CTX_0, 2u8.encode()),
                self.serial_number.encode(),
                algorithm_identifier(self.algorithm),
                &self.issuer,
            ),
            (
                encode::sequence((
                    encode_time(self.not_before),
                    encode_time(self.not_after),
                )),
                &self.subject,
                &self.public_key,
                self.key_usage.map(Self::encode_key_usage),
            ),
        )).to_captured(Mode::Der)
    }

    /// Signs the certificate and returns its DER encoding.
    pub fn sign<F>(&self, signer: F) -> Result<Bytes, DeviceError>
    where
        F: FnOnce(&[u8]) -> Result<Bytes, DeviceError>,
    {
        let tbs = self.encode();
        let signature = signer(tbs.as_slice())?;
        Ok(encode::sequence((
            &tbs,
            algorithm_identifier(self.algorithm),
            BitString::new(0, signature).encode(),
        )).to_captured(Mode::Der).into_bytes())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use openssl::pkey::PKey;
    use openssl::rsa::Padding;
    use crate::commons::test::rsa_key;

    fn software_signer(
        key: &PKey<openssl::pkey::Private>,
        algorithm: SignAlgorithm,
    ) -> impl FnOnce(&[u8]) -> Result<Bytes, DeviceError> + '_ {
        move |data| {
            let digest = algorithm.digest(data)?;
            let info = algorithm.digest_info(&digest)?;
            let rsa = key.rsa()?;
            let mut sig = vec![0; rsa.size() as usize];
            let len = rsa.private_encrypt(&info, &mut sig, Padding::PKCS1)?;
            sig.truncate(len);
            Ok(Bytes::from(sig))
        }
    }

    #[test]
    fn parse_distinguished_name() {
        let dn = DistinguishedName::parse(
            "C=FI, O=Example\\, Ltd, cn=member-1, serialNumber=42"
        ).unwrap();
        assert_eq!(
            dn.to_string(),
            "C=FI, O=Example\\, Ltd, CN=member-1, serialNumber=42"
        );
        assert!(DistinguishedName::parse("").is_err());
        assert!(DistinguishedName::parse("XX=foo").is_err());
        assert!(DistinguishedName::parse("CN=").is_err());
    }

    #[test]
    fn cert_request_verifies() {
        let key = rsa_key();
        let spki = key.public_key_to_der().unwrap();
        let request = CertRequest::new(
            DistinguishedName::parse("C=FI, O=Test, CN=signer").unwrap(),
            &spki,
        ).unwrap();
        let der = request.sign(
            SignAlgorithm::Sha256WithRsa,
            CertRequestFormat::Der,
            software_signer(&key, SignAlgorithm::Sha256WithRsa),
        ).unwrap();

        let parsed = X509Req::from_der(&der).unwrap();
        assert!(parsed.verify(&parsed.public_key().unwrap()).unwrap());
        let cn = parsed.subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next().unwrap()
            .data().as_utf8().unwrap();
        assert_eq!(cn.to_string(), "signer");
    }

    #[test]
    fn pem_cert_request() {
        let key = rsa_key();
        let spki = key.public_key_to_der().unwrap();
        let request = CertRequest::new(
            DistinguishedName::common_name("pem"), &spki
        ).unwrap();
        let pem = request.sign(
            SignAlgorithm::Sha512WithRsa,
            CertRequestFormat::Pem,
            software_signer(&key, SignAlgorithm::Sha512WithRsa),
        ).unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(X509Req::from_pem(&pem).is_ok());
    }

    #[test]
    fn self_signed_certificate_verifies() {
        let key = rsa_key();
        let spki = key.public_key_to_der().unwrap();
        let subject = DistinguishedName::common_name("self");
        let now = Utc::now();
        let tbs = TbsCertificate::new(
            SignAlgorithm::Sha256WithRsa,
            subject.encode(),
            &subject,
            &spki,
            now,
            now + Duration::days(365 * 40),
        ).unwrap().with_key_usage(KeyUsage::Signing);
        let der = tbs.sign(
            software_signer(&key, SignAlgorithm::Sha256WithRsa)
        ).unwrap();

        let cert = X509::from_der(&der).unwrap();
        assert!(cert.verify(&key).unwrap());
        assert_eq!(
            certificate_public_key(&der).unwrap().as_ref(),
            spki.as_slice()
        );
        assert_eq!(
            certificate_subject(&der).unwrap().as_slice(),
            subject.encode().as_slice()
        );
    }

    #[test]
    fn inverted_validity_is_rejected() {
        let key = rsa_key();
        let spki = key.public_key_to_der().unwrap();
        let subject = DistinguishedName::common_name("x");
        let now = Utc::now();
        assert!(TbsCertificate::new(
            SignAlgorithm::Sha256WithRsa,
            subject.encode(),
            &subject,
            &spki,
            now,
            now - Duration::days(1),
        ).is_err());
    }
}
