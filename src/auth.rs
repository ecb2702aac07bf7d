use md5::{Digest, Md5};

use crate::message::NewClientMessage;

/// Signs a token for the given unix timestamp: lowercase hex md5 of the
/// token followed by the decimal timestamp.
pub fn sign_auth(token: &str, timestamp: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the first accepted token whose signature matches the handshake
/// message, or `None` when the client is not trusted.
pub fn verify<'a>(tokens: &'a [String], msg: &NewClientMessage) -> Option<&'a str> {
    tokens
        .iter()
        .map(String::as_str)
        .find(|token| sign_auth(token, msg.timestamp) == msg.auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_shape() {
        let sig = sign_auth("token-x", 1600000000);
        assert_eq!(sig.len(), 32);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sig, sign_auth("token-x", 1600000000));
        assert_ne!(sig, sign_auth("token-x", 1600000001));
        assert_ne!(sig, sign_auth("token-y", 1600000000));
    }

    #[test]
    fn signature_concatenates_decimal_timestamp() {
        // md5 of the literal bytes `t42`
        assert_eq!(sign_auth("t", 42), hex::encode(md5::Md5::digest(b"t42")));
    }

    #[test]
    fn verify_picks_the_matching_token() {
        let tokens = vec!["t1".to_string(), "t2".to_string()];
        let msg = NewClientMessage {
            fqdn: "node-a".into(),
            timestamp: 1234,
            auth: sign_auth("t2", 1234),
        };
        assert_eq!(verify(&tokens, &msg), Some("t2"));

        let bad = NewClientMessage {
            auth: sign_auth("wrong", 1234),
            ..msg
        };
        assert_eq!(verify(&tokens, &bad), None);
    }
}
