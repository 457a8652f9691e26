//! ETS keyring resources (`.knxkeys`).
//!
//! A keyring is the signed bundle exported by the ETS configuration tool,
//! containing all security keys of a KNX project: the backbone key, the
//! tunneling interface credentials, device tool keys and group keys. All key
//! material inside the resource is encrypted with a key derived from the
//! keyring password; this module keeps it encrypted in the model and
//! decrypts on demand.
//!
//! The document signature covers a canonical byte stream over the XML
//! structure (`0x01`-framed start elements with their sorted attributes,
//! `0x02` end markers) followed by the Base64 of the password hash; the
//! first 16 bytes of its SHA-256 must equal the `Signature` attribute.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::Hmac;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};

/// Namespace of keyring documents.
const KEYRING_NAMESPACE: &str = "http://knx.org/xml/keyring/1";

/// Salt of the PBKDF2 password hash.
const PASSWORD_SALT: &[u8] = b"1.keyring.ets.knx.org";

/// PBKDF2 iteration count used by ETS.
const PASSWORD_ITERATIONS: u32 = 65_536;

/// Kind of a keyring interface entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// IP backbone (routing)
    Backbone,
    /// KNXnet/IP tunneling endpoint
    Tunneling,
    /// USB interface
    Usb,
}

impl InterfaceType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "Backbone" => Ok(Self::Backbone),
            "Tunneling" => Ok(Self::Tunneling),
            "USB" => Ok(Self::Usb),
            _ => Err(KnxError::invalid_keyring()),
        }
    }
}

/// The IP backbone entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backbone {
    /// Routing multicast group
    pub multicast_address: Ipv4Addr,
    /// Encrypted backbone (group) key
    pub key: Option<Vec<u8>>,
    /// Multicast latency tolerance
    pub latency: Duration,
}

/// A tunneling/USB/backbone interface entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface kind
    pub kind: InterfaceType,
    /// Individual address of the hosting device
    pub host: Option<IndividualAddress>,
    /// Tunneling address assigned to this interface
    pub address: Option<IndividualAddress>,
    /// Secure session user id (0..=127)
    pub user_id: Option<u8>,
    /// Encrypted user password
    pub password: Option<Vec<u8>>,
    /// Encrypted device authentication code
    pub authentication: Option<Vec<u8>>,
    /// Secured group addresses reachable through this interface, with the
    /// senders allowed on each
    pub groups: HashMap<GroupAddress, BTreeSet<IndividualAddress>>,
}

/// A device entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Encrypted tool key
    pub tool_key: Option<Vec<u8>>,
    /// Encrypted management password
    pub management_password: Option<Vec<u8>>,
    /// Encrypted authentication code
    pub authentication: Option<Vec<u8>>,
    /// Last known 48-bit sending sequence number
    pub sequence: u64,
}

/// A loaded keyring resource. Immutable after load.
#[derive(Debug)]
pub struct Keyring {
    project: String,
    created_by: String,
    created: String,
    signature: [u8; 16],
    backbone: Option<Backbone>,
    interfaces: Vec<Interface>,
    devices: HashMap<IndividualAddress, Device>,
    group_keys: HashMap<GroupAddress, Vec<u8>>,
    // kept verbatim for the signature pass
    document: Vec<u8>,
}

impl Keyring {
    /// Load a keyring from a `.knxkeys` resource.
    ///
    /// # Errors
    ///
    /// Returns a keyring error for wrong extensions, malformed XML, a
    /// missing namespace, or out-of-range attribute values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|ext| ext.to_str()) != Some("knxkeys") {
            return Err(KnxError::invalid_keyring());
        }
        let document = std::fs::read(path).map_err(|e| {
            log::warn!("keyring {}: {e}", path.display());
            KnxError::invalid_keyring()
        })?;
        Self::from_xml(document)
    }

    /// Parse a keyring document from its raw bytes.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Keyring::load`].
    pub fn from_xml(document: Vec<u8>) -> Result<Self> {
        let mut reader = Reader::from_reader(document.as_slice());
        let mut buf = Vec::new();

        let mut project = String::new();
        let mut created_by = String::new();
        let mut created = String::new();
        let mut signature = None;
        let mut backbone = None;
        let mut interfaces: Vec<Interface> = Vec::new();
        let mut devices = HashMap::new();
        let mut group_keys = HashMap::new();

        let mut seen_root = false;
        let mut in_devices = false;
        let mut in_group_addresses = false;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| {
                    log::warn!("keyring: XML error at {}: {e}", reader.buffer_position());
                    KnxError::invalid_keyring()
                })?
                .into_owned();
            buf.clear();

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let name = local_name(e);
                    match name.as_str() {
                        "Keyring" => {
                            let attrs = attributes(e)?;
                            if attrs.get("xmlns").map(String::as_str) != Some(KEYRING_NAMESPACE) {
                                return Err(KnxError::invalid_keyring());
                            }
                            project = attrs.get("Project").cloned().unwrap_or_default();
                            created_by = attrs.get("CreatedBy").cloned().unwrap_or_default();
                            created = attrs
                                .get("Created")
                                .cloned()
                                .ok_or_else(KnxError::invalid_keyring)?;
                            let sig = attrs
                                .get("Signature")
                                .ok_or_else(KnxError::invalid_keyring)?;
                            signature = Some(decode_b64_fixed(sig)?);
                            seen_root = true;
                        }
                        "Backbone" => {
                            let attrs = attributes(e)?;
                            let multicast_address = attrs
                                .get("MulticastAddress")
                                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                                .ok_or_else(KnxError::invalid_keyring)?;
                            let key = attrs.get("Key").map(|s| decode_b64(s)).transpose()?;
                            let latency = attrs
                                .get("Latency")
                                .map_or(Ok(2000), |s| {
                                    s.parse::<u64>().map_err(|_| KnxError::invalid_keyring())
                                })
                                .map(Duration::from_millis)?;
                            backbone = Some(Backbone {
                                multicast_address,
                                key,
                                latency,
                            });
                        }
                        "Interface" => {
                            let attrs = attributes(e)?;
                            let kind = InterfaceType::parse(
                                attrs
                                    .get("Type")
                                    .ok_or_else(KnxError::invalid_keyring)?,
                            )?;
                            let user_id = attrs
                                .get("UserID")
                                .map(|s| {
                                    s.parse::<u8>()
                                        .ok()
                                        .filter(|id| *id <= 127)
                                        .ok_or_else(KnxError::invalid_keyring)
                                })
                                .transpose()?;
                            interfaces.push(Interface {
                                kind,
                                host: parse_opt_address(attrs.get("Host"))?,
                                address: parse_opt_address(attrs.get("IndividualAddress"))?,
                                user_id,
                                password: attrs.get("Password").map(|s| decode_b64(s)).transpose()?,
                                authentication: attrs
                                    .get("Authentication")
                                    .map(|s| decode_b64(s))
                                    .transpose()?,
                                groups: HashMap::new(),
                            });
                        }
                        "Devices" => in_devices = true,
                        "GroupAddresses" => in_group_addresses = true,
                        "Device" if in_devices => {
                            let attrs = attributes(e)?;
                            let addr = attrs
                                .get("IndividualAddress")
                                .and_then(|s| s.parse::<IndividualAddress>().ok())
                                .ok_or_else(KnxError::invalid_keyring)?;
                            let sequence = attrs
                                .get("SequenceNumber")
                                .map_or(Ok(0), |s| {
                                    s.parse::<u64>().map_err(|_| KnxError::invalid_keyring())
                                })?;
                            if sequence > 0xFFFF_FFFF_FFFF {
                                return Err(KnxError::invalid_keyring());
                            }
                            devices.insert(
                                addr,
                                Device {
                                    tool_key: attrs
                                        .get("ToolKey")
                                        .map(|s| decode_b64(s))
                                        .transpose()?,
                                    management_password: attrs
                                        .get("ManagementPassword")
                                        .map(|s| decode_b64(s))
                                        .transpose()?,
                                    authentication: attrs
                                        .get("Authentication")
                                        .map(|s| decode_b64(s))
                                        .transpose()?,
                                    sequence,
                                },
                            );
                        }
                        "Group" if in_group_addresses => {
                            let attrs = attributes(e)?;
                            let addr = parse_group_attr(attrs.get("Address"))?;
                            let key = attrs
                                .get("Key")
                                .map(|s| decode_b64(s))
                                .transpose()?
                                .ok_or_else(KnxError::invalid_keyring)?;
                            group_keys.insert(addr, key);
                        }
                        "Group" => {
                            // nested under the current interface
                            let attrs = attributes(e)?;
                            let addr = parse_group_attr(attrs.get("Address"))?;
                            let senders = attrs
                                .get("Senders")
                                .map(String::as_str)
                                .unwrap_or_default()
                                .split_whitespace()
                                .map(|s| s.parse::<IndividualAddress>())
                                .collect::<Result<BTreeSet<_>>>()?;
                            if let Some(interface) = interfaces.last_mut() {
                                interface.groups.insert(addr, senders);
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => {
                    match String::from_utf8_lossy(e.local_name().as_ref()).as_ref() {
                        "Devices" => in_devices = false,
                        "GroupAddresses" => in_group_addresses = false,
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(KnxError::invalid_keyring());
        }

        Ok(Self {
            project,
            created_by,
            created,
            signature: signature.ok_or_else(KnxError::invalid_keyring)?,
            backbone,
            interfaces,
            devices,
            group_keys,
            document,
        })
    }

    /// Project name.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The ETS version that exported the keyring.
    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Export timestamp, verbatim; its SHA-256 prefix doubles as decryption
    /// IV.
    pub fn created(&self) -> &str {
        &self.created
    }

    /// The 16-byte document signature.
    pub fn signature(&self) -> [u8; 16] {
        self.signature
    }

    /// The backbone entry, if present.
    pub fn backbone(&self) -> Option<&Backbone> {
        self.backbone.as_ref()
    }

    /// All interface entries.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Interface entries hosted by `host`.
    pub fn interfaces_of(&self, host: IndividualAddress) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter().filter(move |i| i.host == Some(host))
    }

    /// Device entries by individual address.
    pub fn devices(&self) -> &HashMap<IndividualAddress, Device> {
        &self.devices
    }

    /// Encrypted group keys by group address.
    pub fn group_keys(&self) -> &HashMap<GroupAddress, Vec<u8>> {
        &self.group_keys
    }

    /// Verify the document signature against the keyring password.
    ///
    /// Walks the document a second time emitting the canonical byte stream
    /// and compares its truncated SHA-256 with the `Signature` attribute.
    ///
    /// # Errors
    ///
    /// Returns a keyring signature error on mismatch.
    pub fn verify(&self, password: &str) -> Result<()> {
        let hash = password_hash(password);
        let stream = self.canonical_stream(&hash)?;
        let digest = Sha256::digest(&stream);
        if digest[..16] != self.signature {
            log::warn!("keyring '{}': signature mismatch", self.project);
            return Err(KnxError::keyring_signature_mismatch());
        }
        Ok(())
    }

    /// Decrypt an encrypted key from this keyring.
    ///
    /// # Errors
    ///
    /// Returns a keyring error if the ciphertext length is not a whole
    /// number of cipher blocks.
    pub fn decrypt_key(&self, ciphertext: &[u8], password: &str) -> Result<Vec<u8>> {
        let key = password_hash(password);
        let iv = created_hash(&self.created);
        aes128_cbc_decrypt(&key, &iv, ciphertext)
    }

    /// Decrypt an encrypted password (user/management/authentication).
    ///
    /// Applies the same cipher as [`Keyring::decrypt_key`], then strips the
    /// 8-byte random preamble and the trailer whose length is given by the
    /// last byte.
    ///
    /// # Errors
    ///
    /// Returns a keyring error on bad ciphertext structure or non-UTF-8
    /// plaintext.
    pub fn decrypt_password(&self, ciphertext: &[u8], password: &str) -> Result<String> {
        let plain = self.decrypt_key(ciphertext, password)?;
        let trailer = usize::from(*plain.last().ok_or_else(KnxError::keyring_decryption_failed)?);
        if plain.len() < 8 + trailer {
            return Err(KnxError::keyring_decryption_failed());
        }
        String::from_utf8(plain[8..plain.len() - trailer].to_vec())
            .map_err(|_| KnxError::keyring_decryption_failed())
    }

    /// The canonical byte stream the signature covers.
    fn canonical_stream(&self, hash: &Zeroizing<[u8; 16]>) -> Result<Vec<u8>> {
        let mut reader = Reader::from_reader(self.document.as_slice());
        let mut buf = Vec::new();
        let mut out = Vec::with_capacity(self.document.len());

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|_| KnxError::invalid_keyring())?
                .into_owned();
            buf.clear();

            match event {
                Event::Start(ref e) => write_canonical_element(&mut out, e)?,
                Event::Empty(ref e) => {
                    write_canonical_element(&mut out, e)?;
                    out.push(0x02);
                }
                Event::End(_) => out.push(0x02),
                Event::Eof => break,
                _ => {}
            }
        }

        let b64 = BASE64.encode(hash.as_slice());
        out.push(b64.len() as u8);
        out.extend_from_slice(b64.as_bytes());
        Ok(out)
    }
}

/// Derive the 128-bit keyring password hash
/// (PBKDF2-HMAC-SHA256, 65536 rounds). Scrubbed on drop.
fn password_hash(password: &str) -> Zeroizing<[u8; 16]> {
    let mut out = Zeroizing::new([0u8; 16]);
    // HMAC accepts keys of any length; the derivation cannot fail
    let _ = pbkdf2::pbkdf2::<Hmac<Sha256>>(
        password.as_bytes(),
        PASSWORD_SALT,
        PASSWORD_ITERATIONS,
        &mut *out,
    );
    out
}

/// Derive the decryption IV from the `Created` attribute.
fn created_hash(created: &str) -> [u8; 16] {
    let digest = Sha256::digest(created.as_bytes());
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

fn aes128_cbc_decrypt(key: &Zeroizing<[u8; 16]>, iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(KnxError::keyring_decryption_failed());
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_slice()));
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev = *iv;
    for chunk in ciphertext.chunks_exact(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        let mut ga = GenericArray::from(block);
        cipher.decrypt_block(&mut ga);
        for (b, p) in ga.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        out.extend_from_slice(&ga);
        prev.copy_from_slice(chunk);
    }
    Ok(out)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|_| KnxError::invalid_keyring())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|_| KnxError::invalid_keyring())?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

/// Append `[0x01][len][name]` and the sorted `[len][name][len][value]`
/// attribute pairs of one element, skipping `xmlns*` and `Signature`.
fn write_canonical_element(out: &mut Vec<u8>, e: &BytesStart<'_>) -> Result<()> {
    out.push(0x01);
    let name = e.local_name();
    write_framed(out, name.as_ref());

    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|_| KnxError::invalid_keyring())?;
        let qname = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if qname == "Signature" || qname == "xmlns" || qname.starts_with("xmlns:") {
            continue;
        }
        let local = qname.rsplit(':').next().unwrap_or(&qname).to_owned();
        let value = attr
            .unescape_value()
            .map_err(|_| KnxError::invalid_keyring())?
            .into_owned();
        attrs.push((local, value));
    }
    attrs.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in attrs {
        write_framed(out, name.as_bytes());
        write_framed(out, value.as_bytes());
    }
    Ok(())
}

fn write_framed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn decode_b64(s: &str) -> Result<Vec<u8>> {
    BASE64.decode(s).map_err(|_| KnxError::invalid_keyring())
}

fn decode_b64_fixed(s: &str) -> Result<[u8; 16]> {
    let bytes = decode_b64(s)?;
    bytes.try_into().map_err(|_| KnxError::invalid_keyring())
}

fn parse_opt_address(s: Option<&String>) -> Result<Option<IndividualAddress>> {
    s.map(|s| {
        s.parse::<IndividualAddress>()
            .map_err(|_| KnxError::invalid_keyring())
    })
    .transpose()
}

fn parse_group_attr(s: Option<&String>) -> Result<GroupAddress> {
    let s = s.ok_or_else(KnxError::invalid_keyring)?;
    // ETS writes the raw 16-bit value in group address attributes
    if let Ok(raw) = s.parse::<u16>() {
        return Ok(GroupAddress::from(raw));
    }
    s.parse::<GroupAddress>()
        .map_err(|_| KnxError::invalid_keyring())
}
