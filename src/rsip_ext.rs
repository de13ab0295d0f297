pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

#[macro_export]
macro_rules! header_pop {
    ($iter:expr, $header:path) => {
        let mut first = true;
        $iter.retain(|h| {
            if first && matches!(h, $header(_)) {
                first = false;
                false
            } else {
                true
            }
        });
    };
}

/// Pull the URI out of a Contact/Route style header value, dropping any
/// display name and angle brackets.
pub fn extract_uri(value: &str) -> crate::Result<rsip::Uri> {
    let value = value.trim();
    let inner = match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value,
    };
    rsip::Uri::try_from(inner).map_err(Into::into)
}

#[test]
fn test_extract_uri() {
    let uri = extract_uri("\"Alice\" <sip:alice@1.2.3.4:5060>;expires=300").expect("uri");
    assert_eq!(uri.host_with_port.to_string(), "1.2.3.4:5060");

    let uri = extract_uri("sip:bob@example.com").expect("uri");
    assert_eq!(uri.user(), Some("bob"));
}
