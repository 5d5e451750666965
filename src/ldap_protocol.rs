// LDAP message inspection with BER encoding/decoding.
// Parses only the operations the proxy looks at; everything else is Other and
// relayed untouched.

use anyhow::{Context, Result, bail};
use std::io::{Cursor, Read};

// LDAP result codes (RFC 4511) the proxy cares about.
pub const RC_SUCCESS: i32 = 0;
pub const RC_INVALID_CREDENTIALS: i32 = 49;

/// Human-readable result code for log lines.
pub fn result_code_name(rc: i32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        32 => "noSuchObject",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        _ => "other",
    }
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    UnbindRequest,
    /// Any operation the proxy does not inspect; carries the application tag.
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String },
}

impl BindRequest {
    pub fn is_simple(&self) -> bool {
        matches!(self.authentication, BindAuthentication::Simple(_))
    }
}

#[derive(Debug, Clone)]
pub struct BindResponse {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub filter: Filter,
}

/// Search filter (RFC 4511 Filter CHOICE). Only equalityMatch is decoded;
/// other choices keep their context tag and are not interpreted.
#[derive(Debug, Clone)]
pub enum Filter {
    EqualityMatch { attribute: String, value: String },
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
}

// BER parsing utilities
struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!(
                    "BER truncated: length encoding needs {} bytes, {} remaining",
                    length_bytes,
                    self.remaining()
                );
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length > 4 {
            bail!("Integer too large: {} bytes", length);
        }
        if self.remaining() < length {
            bail!(
                "BER truncated: integer needs {} bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        let mut buf = vec![0u8; length];
        self.cursor.read_exact(&mut buf)?;

        let mut value = 0i32;
        for &byte in &buf {
            value = (value << 8) | (byte as i32);
        }

        // Sign extension for negative numbers
        if length < 4 && !buf.is_empty() && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }

        Ok(value)
    }

    /// Read OCTET STRING TLV. Tolerant about the tag: universal 0x04, SEQUENCE
    /// 0x30 (some clients wrap the DN), or context-specific 0x80..=0xBF.
    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = (tag & 0x1F) == 0x04 || tag == 0x30 || (0x80..=0xBF).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value of OCTET STRING (tag already consumed).
    fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        if self.remaining() < length {
            bail!(
                "BER truncated: octet string needs {} bytes, {} remaining",
                length,
                self.remaining()
            );
        }
        let mut buf = vec![0u8; length];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            bail!("Expected SEQUENCE tag, got: 0x{:02X}", tag);
        }
        self.read_length()
    }

    fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            bail!("Enumerated value must be 1-4 bytes, got: {}", length);
        }
        if self.remaining() < length {
            bail!("BER truncated: enumerated needs {} bytes", length);
        }
        let mut value = 0i32;
        let mut buf = [0u8; 1];
        for _ in 0..length {
            self.cursor.read_exact(&mut buf)?;
            value = (value << 8) | buf[0] as i32;
        }
        Ok(value)
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// BER encoding utilities
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02); // INTEGER tag
        let bytes = value.to_be_bytes();
        let start = bytes
            .iter()
            .position(|&b| b != 0 || (value < 0 && b != 0xFF))
            .unwrap_or(3);
        let actual_bytes = &bytes[start..];
        if actual_bytes.is_empty() || (value >= 0 && actual_bytes[0] & 0x80 != 0) {
            // Need sign extension
            self.write_length(actual_bytes.len() + 1);
            if value >= 0 {
                self.buffer.push(0);
            } else {
                self.buffer.push(0xFF);
            }
            self.buffer.extend_from_slice(actual_bytes);
        } else {
            self.write_length(actual_bytes.len());
            self.buffer.extend_from_slice(actual_bytes);
        }
    }

    fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04); // OCTET STRING tag
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A); // ENUMERATED tag
        self.write_length(1);
        self.buffer.push(value);
    }

    /// Reserve a length byte (no tag). Used for [APPLICATION n] IMPLICIT SEQUENCE.
    /// Call patch_implicit_sequence_length(pos) after writing the content.
    pub fn write_length_placeholder(&mut self) -> usize {
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn patch_implicit_sequence_length(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.write_tag(0x30); // SEQUENCE tag
        self.write_length_placeholder()
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.patch_implicit_sequence_length(start_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;

/// equalityMatch [3] within the Filter CHOICE.
const FILTER_TAG_EQUALITY_MATCH: u8 = 0xA3;

/// Top-level LDAPMessage is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Parse the first LDAPMessage in `data`. Trailing bytes after the declared
/// outer length (pipelined messages) are ignored.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    if data.first() != Some(&LDAP_MESSAGE_SEQUENCE_TAG) {
        bail!(
            "Not an LDAPMessage: first byte 0x{:02X}",
            data.first().copied().unwrap_or(0)
        );
    }
    let mut outer = BerReader::new(data);
    let seq_len = outer.read_sequence()?;
    let start = outer.cursor.position() as usize;
    if data.len() < start + seq_len {
        bail!(
            "BER truncated: message declares {} content bytes, {} available",
            seq_len,
            data.len() - start
        );
    }

    // Bound all further reads to the declared outer length.
    let mut reader = BerReader::new(&data[start..start + seq_len]);
    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let op_len = reader.read_length()?;
    let op_content = reader.read_raw_bytes(op_len)?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&op_content)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&op_content)?),
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&op_content)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&op_content)?)
        }
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        other => ProtocolOp::Other(other),
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
    })
}

fn parse_bind_request(content: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(content);
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // Authentication: RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80), but
    // clients send various tags (0x41, 0x61, ...). Anything that is not SASL
    // (0xA3, constructed) is treated as a simple bind.
    let auth_tag = reader.read_tag()?;
    let authentication = if auth_tag == 0xA3 {
        let sasl_len = reader.read_length()?;
        let sasl_content = reader.read_raw_bytes(sasl_len)?;
        let mut sasl = BerReader::new(&sasl_content);
        let mechanism = sasl.read_string()?;
        BindAuthentication::Sasl { mechanism }
    } else {
        let password = reader.read_octet_string_value()?;
        BindAuthentication::Simple(String::from_utf8(password)?)
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(content: &[u8]) -> Result<BindResponse> {
    let mut reader = BerReader::new(content);
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    Ok(BindResponse {
        result_code,
        matched_dn,
        diagnostic_message,
    })
}

fn parse_search_request(content: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(content);
    let base_object = reader.read_string()?;
    let _scope = reader.read_enumerated()?;
    let _deref_aliases = reader.read_enumerated()?;
    let _size_limit = reader.read_integer()?;
    let _time_limit = reader.read_integer()?;
    let _types_only = reader.read_boolean()?;
    let filter = parse_filter(&mut reader)?;
    // Requested attribute list follows; irrelevant here.

    Ok(SearchRequest {
        base_object,
        filter,
    })
}

/// Filter CHOICE (RFC 4511): only equalityMatch [3] is decoded. The AVA uses
/// implicit tagging (no inner SEQUENCE), but some encoders emit one anyway;
/// both forms are accepted.
fn parse_filter(reader: &mut BerReader) -> Result<Filter> {
    let tag = reader.read_tag()?;
    let len = reader.read_length()?;
    let content = reader.read_raw_bytes(len)?;
    if tag != FILTER_TAG_EQUALITY_MATCH {
        return Ok(Filter::Other(tag));
    }
    let mut sub = BerReader::new(&content);
    if content.first() == Some(&0x30) {
        let _seq = sub.read_sequence()?;
    }
    let attribute = sub.read_string()?;
    let value = sub.read_string()?;
    Ok(Filter::EqualityMatch { attribute, value })
}

fn parse_search_result_entry(content: &[u8]) -> Result<SearchResultEntry> {
    let mut reader = BerReader::new(content);
    let object_name = reader.read_string()?;
    // Attribute list follows; only the DN is consumed.
    Ok(SearchResultEntry { object_name })
}

/// Build a minimal well-formed BindResponse: result code, empty matched DN and
/// diagnostic message. Used to synthesize invalidCredentials with the message
/// id of the response it replaces.
pub fn build_bind_response(message_id: i32, result_code: i32) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    writer.write_tag(LDAP_TAG_BIND_RESPONSE);
    let len_pos = writer.write_length_placeholder();
    writer.write_enumerated(result_code as u8);
    writer.write_string("");
    writer.write_string("");
    writer.patch_implicit_sequence_length(len_pos);
    writer.end_sequence(seq_start);
    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ber_writer_integer() {
        let mut writer = BerWriter::new();
        writer.write_integer(0);
        writer.write_integer(127);
        writer.write_integer(-128);
        writer.write_integer(256);
        writer.write_integer(-1);
        let result = writer.into_vec();
        assert!(!result.is_empty());
    }

    #[test]
    fn test_ber_writer_sequence() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        writer.write_integer(42);
        writer.write_string("test");
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        assert_eq!(result[0], 0x30); // SEQUENCE tag
        assert_eq!(result[1] as usize, result.len() - 2);
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        for _ in 0..200 {
            writer.write_string("test");
        }
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        // Length is encoded in long form (starts with 0x8X)
        assert!(result[1] & 0x80 != 0);
    }

    #[test]
    fn test_ber_reader_integer() {
        let data = vec![0x02, 0x01, 0x2A]; // INTEGER 42
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), 42);
    }

    #[test]
    fn test_ber_reader_negative_integer() {
        let data = vec![0x02, 0x01, 0xFF]; // INTEGER -1
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), -1);
    }

    #[test]
    fn test_ber_reader_octet_string_boundaries() {
        for len in [0usize, 1, 127, 128, 256] {
            let s = "x".repeat(len);
            let mut writer = BerWriter::new();
            writer.write_string(&s);
            let encoded = writer.into_vec();
            let mut reader = BerReader::new(&encoded);
            let decoded = reader.read_octet_string().unwrap();
            assert_eq!(decoded.len(), len, "length {}", len);
        }
    }

    #[test]
    fn test_ber_truncated_integer_fails() {
        let data = vec![0x02, 0x02, 0xFF]; // INTEGER length 2 but only 1 byte
        let mut reader = BerReader::new(&data);
        assert!(reader.read_integer().is_err());
    }

    #[test]
    fn test_ber_invalid_tag_fails() {
        let data = vec![0x05, 0x00]; // NULL tag when expecting INTEGER
        let mut reader = BerReader::new(&data);
        assert!(reader.read_integer().is_err());
    }

    /// BindRequest, simple auth with RFC tag 0x80.
    /// name = "cn=admin,dc=example,dc=com" (26 bytes), password = "secret".
    #[test]
    fn test_parse_bind_request_simple_tag_0x80() {
        let msg = vec![
            0x30, 0x2c, // SEQUENCE length 44
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x27, // [APPLICATION 0] BindRequest length 39
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] simple "secret"
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 1);
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => {
                assert_eq!(b.version, 3);
                assert_eq!(b.name, "cn=admin,dc=example,dc=com");
                assert!(b.is_simple());
                match &b.authentication {
                    BindAuthentication::Simple(pw) => assert_eq!(pw, "secret"),
                    _ => panic!("expected Simple bind"),
                }
            }
            _ => panic!("expected BindRequest"),
        }
    }

    /// Same bind but auth tag 0x41 (seen from some clients).
    #[test]
    fn test_parse_bind_request_simple_tag_0x41() {
        let msg = vec![
            0x30, 0x2c, 0x02, 0x01, 0x01, 0x60, 0x27, 0x02, 0x01, 0x03, 0x04, 0x1a, 0x63, 0x6e,
            0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d, 0x65, 0x78, 0x61, 0x6d,
            0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, 0x41, 0x06, 0x73, 0x65,
            0x63, 0x72, 0x65, 0x74,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => assert!(b.is_simple()),
            _ => panic!("expected BindRequest"),
        }
    }

    /// BindRequest with SASL auth (tag 0xA3): mechanism "EXTERNAL".
    #[test]
    fn test_parse_bind_request_sasl() {
        let msg = vec![
            0x30, 0x30, // SEQUENCE length 48
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x2b, // BindRequest length 43
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d,
            0xA3, 0x0a, // [3] SaslCredentials length 10
            0x04, 0x08, 0x45, 0x58, 0x54, 0x45, 0x52, 0x4e, 0x41, 0x4c, // "EXTERNAL"
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => {
                assert!(!b.is_simple());
                match &b.authentication {
                    BindAuthentication::Sasl { mechanism } => assert_eq!(mechanism, "EXTERNAL"),
                    _ => panic!("expected Sasl bind"),
                }
            }
            _ => panic!("expected BindRequest"),
        }
    }

    /// SearchRequest with equalityMatch filter (uid=alice), implicit AVA
    /// tagging as standard encoders produce it.
    #[test]
    fn test_parse_search_request_equality_filter() {
        let msg = vec![
            0x30, 0x31, // SEQUENCE 49
            0x02, 0x01, 0x02, // messageID 2
            0x63, 0x2c, // SearchRequest length 44
            0x04, 0x0b, 0x64, 0x63, 0x3d, 0x78, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, // base "dc=x,dc=com"
            0x0A, 0x01, 0x02, // scope wholeSubtree
            0x0A, 0x01, 0x00, // derefAliases never
            0x02, 0x01, 0x00, // sizeLimit 0
            0x02, 0x01, 0x00, // timeLimit 0
            0x01, 0x01, 0x00, // typesOnly false
            0xA3, 0x0c, 0x04, 0x03, 0x75, 0x69, 0x64, 0x04, 0x05, 0x61, 0x6c, 0x69, 0x63,
            0x65, // uid=alice
            0x30, 0x00, // attributes empty SEQUENCE
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => {
                assert_eq!(sr.base_object, "dc=x,dc=com");
                match &sr.filter {
                    Filter::EqualityMatch { attribute, value } => {
                        assert_eq!(attribute, "uid");
                        assert_eq!(value, "alice");
                    }
                    _ => panic!("expected EqualityMatch"),
                }
            }
            _ => panic!("expected SearchRequest"),
        }
    }

    /// Some encoders wrap the AVA in an explicit inner SEQUENCE; accepted too.
    #[test]
    fn test_parse_search_request_equality_filter_inner_sequence() {
        let msg = vec![
            0x30, 0x33, 0x02, 0x01, 0x02, 0x63, 0x2e, 0x04, 0x0b, 0x64, 0x63, 0x3d, 0x78, 0x2c,
            0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, 0x0A, 0x01, 0x02, 0x0A, 0x01, 0x00, 0x02, 0x01,
            0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0xA3, 0x0e, 0x30, 0x0c, 0x04, 0x03, 0x75,
            0x69, 0x64, 0x04, 0x05, 0x61, 0x6c, 0x69, 0x63, 0x65, 0x30, 0x00,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => match &sr.filter {
                Filter::EqualityMatch { attribute, value } => {
                    assert_eq!(attribute, "uid");
                    assert_eq!(value, "alice");
                }
                _ => panic!("expected EqualityMatch"),
            },
            _ => panic!("expected SearchRequest"),
        }
    }

    /// present filter [7] is not interpreted.
    #[test]
    fn test_parse_search_request_present_filter_is_other() {
        let msg = vec![
            0x30, 0x27, // SEQUENCE 39
            0x02, 0x01, 0x01, 0x63, 0x22, 0x04, 0x00, 0x0A, 0x01, 0x02, 0x0A, 0x01, 0x00, 0x02,
            0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0x87, 0x0D, 0x04, 0x0B, 0x6f, 0x62,
            0x6a, 0x65, 0x63, 0x74, 0x43, 0x6c, 0x61, 0x73, 0x73, 0x30, 0x00,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchRequest(sr) => match sr.filter {
                Filter::Other(tag) => assert_eq!(tag, 0x87),
                _ => panic!("expected Other filter"),
            },
            _ => panic!("expected SearchRequest"),
        }
    }

    #[test]
    fn test_parse_bind_response_success() {
        let msg = build_bind_response(7, RC_SUCCESS);
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 7);
        match &parsed.protocol_op {
            ProtocolOp::BindResponse(r) => {
                assert_eq!(r.result_code, RC_SUCCESS);
                assert_eq!(r.matched_dn, "");
                assert_eq!(r.diagnostic_message, "");
            }
            _ => panic!("expected BindResponse"),
        }
    }

    #[test]
    fn test_build_bind_response_invalid_credentials() {
        let bytes = build_bind_response(3, RC_INVALID_CREDENTIALS);
        // Envelope: SEQUENCE with exact declared length
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[1] as usize, bytes.len() - 2);
        let parsed = parse_ldap_message(&bytes).unwrap();
        assert_eq!(parsed.message_id, 3);
        match &parsed.protocol_op {
            ProtocolOp::BindResponse(r) => assert_eq!(r.result_code, RC_INVALID_CREDENTIALS),
            _ => panic!("expected BindResponse"),
        }
    }

    #[test]
    fn test_parse_search_result_entry() {
        // SearchResultEntry { objectName "cn=a,dc=x", attributes {} }
        let msg = vec![
            0x30, 0x12, // SEQUENCE 18
            0x02, 0x01, 0x02, // messageID 2
            0x64, 0x0d, // SearchResultEntry length 13
            0x04, 0x09, 0x63, 0x6e, 0x3d, 0x61, 0x2c, 0x64, 0x63, 0x3d, 0x78, // "cn=a,dc=x"
            0x30, 0x00, // attributes empty
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match &parsed.protocol_op {
            ProtocolOp::SearchResultEntry(e) => assert_eq!(e.object_name, "cn=a,dc=x"),
            _ => panic!("expected SearchResultEntry"),
        }
    }

    #[test]
    fn test_parse_unknown_op_is_other() {
        // AbandonRequest [APPLICATION 16]: 0x50 with integer payload
        let msg = vec![0x30, 0x06, 0x02, 0x01, 0x05, 0x50, 0x01, 0x03];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 5);
        match parsed.protocol_op {
            ProtocolOp::Other(tag) => assert_eq!(tag, 0x50),
            _ => panic!("expected Other"),
        }
    }

    #[test]
    fn test_parse_unbind() {
        let msg = vec![0x30, 0x05, 0x02, 0x01, 0x09, 0x42, 0x00];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert!(matches!(parsed.protocol_op, ProtocolOp::UnbindRequest));
    }

    #[test]
    fn test_parse_tolerates_trailing_bytes() {
        let mut msg = build_bind_response(1, RC_SUCCESS);
        msg.extend_from_slice(&build_bind_response(2, RC_SUCCESS));
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 1);
    }

    #[test]
    fn test_parse_truncated_message_fails() {
        let msg = build_bind_response(1, RC_SUCCESS);
        assert!(parse_ldap_message(&msg[..msg.len() - 3]).is_err());
    }

    #[test]
    fn test_parse_not_a_sequence_fails() {
        assert!(parse_ldap_message(&[0x04, 0x02, 0x30, 0x30]).is_err());
        assert!(parse_ldap_message(&[]).is_err());
    }

    #[test]
    fn test_result_code_name() {
        assert_eq!(result_code_name(RC_SUCCESS), "success");
        assert_eq!(result_code_name(RC_INVALID_CREDENTIALS), "invalidCredentials");
        assert_eq!(result_code_name(4242), "other");
    }
}
