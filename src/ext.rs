//! HTTP extensions.

use bytes::Bytes;

/// A reason phrase in an HTTP/1 response.
///
/// # Clients
///
/// A `ReasonPhrase` will be present in the extensions of the `http::Response`
/// only when the phrase sent by the server differs from the canonical one for
/// the status code.
///
/// ```
/// # use http::Response;
/// # use wirepool::ext::ReasonPhrase;
/// # fn take(res: Response<()>) {
/// if let Some(reason) = res.extensions().get::<ReasonPhrase>() {
///     assert_ne!(reason.as_bytes(), &b"OK"[..]);
/// }
/// # }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReasonPhrase(Bytes);

impl ReasonPhrase {
    /// Gets the reason phrase as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn from_bytes(reason: Bytes) -> Self {
        Self(reason)
    }
}

impl AsRef<[u8]> for ReasonPhrase {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
