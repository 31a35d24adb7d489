//! TLS record detection and ClientHello SNI extraction.
//!
//! Every step bails out with `None` at the first missing byte, so
//! truncated or hostile handshakes simply yield no SNI.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

const TLS_1_0: u16 = 0x0301;
const TLS_1_3: u16 = 0x0304;

/// Record header (5) plus at least the handshake type byte.
const MIN_HANDSHAKE_LEN: usize = 6;

/// Record version if `payload` opens a TLS 1.0–1.3 handshake record.
pub fn handshake_version(payload: &[u8]) -> Option<u16> {
    if payload.len() < MIN_HANDSHAKE_LEN || payload[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let version = u16::from_be_bytes([payload[1], payload[2]]);
    (TLS_1_0..=TLS_1_3).contains(&version).then_some(version)
}

pub fn version_label(version: u16) -> String {
    match version {
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        _ => format!("Unknown (0x{:04x})", version),
    }
}

/// Cursor over a byte slice that fails closed.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Server name from a ClientHello record, or `None`.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if payload.len() < MIN_HANDSHAKE_LEN || payload[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if payload.len() < 5 + record_len {
        return None;
    }

    let mut r = Reader::new(payload);
    r.skip(5)?;
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    r.skip(3)?; // handshake length
    r.skip(2)?; // client version
    r.skip(32)?; // random

    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let mut extensions = Reader::new(r.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }
    None
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    let list_len = r.u16()? as usize;
    if r.remaining() < list_len {
        return None;
    }

    while r.remaining() >= 3 {
        let name_type = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = r.take(name_len)?;
        if name_type == NAME_TYPE_HOST_NAME {
            return Some(String::from_utf8_lossy(name).into_owned());
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// ClientHello record carrying `host` in a server_name extension,
    /// preceded by an unrelated extension.
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let mut sni_list = vec![NAME_TYPE_HOST_NAME];
        sni_list.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_list.extend_from_slice(host.as_bytes());

        let mut sni_ext = (sni_list.len() as u16).to_be_bytes().to_vec();
        sni_ext.extend_from_slice(&sni_list);

        let mut extensions = Vec::new();
        // supported_groups: x25519
        extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0xab; 32]);
        hello.push(4);
        hello.extend_from_slice(&[1, 2, 3, 4]);
        hello.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0xc0, 0x2f]);
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_host_name() {
        let record = client_hello("example.com");
        assert_eq!(extract_sni(&record).as_deref(), Some("example.com"));
        assert_eq!(handshake_version(&record), Some(0x0301));
    }

    #[test]
    fn truncated_hello_yields_nothing() {
        let record = client_hello("example.com");
        assert_eq!(extract_sni(&record[..record.len() - 1]), None);
    }

    #[test]
    fn truncated_extensions_block_yields_nothing() {
        let mut record = client_hello("example.com");
        // Shrink the record and handshake headers too, so only the
        // extensions block itself comes up one byte short.
        record.pop();
        let record_len = (record.len() - 5) as u16;
        record[3..5].copy_from_slice(&record_len.to_be_bytes());
        let hs_len = (record.len() - 9) as u32;
        record[6..9].copy_from_slice(&hs_len.to_be_bytes()[1..]);
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn server_hello_has_no_sni() {
        let mut record = client_hello("example.com");
        record[5] = 0x02;
        assert_eq!(extract_sni(&record), None);
        assert!(handshake_version(&record).is_some());
    }

    #[test]
    fn first_host_name_entry_wins() {
        let mut body = Vec::new();
        let entries: [(u8, &[u8]); 3] = [(1, b"ignored"), (0, b"first.test"), (0, b"second.test")];
        let mut list = Vec::new();
        for (kind, name) in entries {
            list.push(kind);
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);
        }
        body.extend_from_slice(&(list.len() as u16).to_be_bytes());
        body.extend_from_slice(&list);
        assert_eq!(parse_server_name(&body).as_deref(), Some("first.test"));
    }

    #[test]
    fn version_gate() {
        assert_eq!(handshake_version(&[0x16, 0x03, 0x00, 0, 1, 1]), None);
        assert_eq!(handshake_version(&[0x16, 0x03, 0x05, 0, 1, 1]), None);
        assert_eq!(handshake_version(&[0x17, 0x03, 0x03, 0, 1, 1]), None);
        assert_eq!(handshake_version(&[0x16, 0x03, 0x03, 0, 1]), None);
        assert_eq!(version_label(0x0304), "TLS 1.3");
        assert_eq!(version_label(0x0200), "Unknown (0x0200)");
    }
}
