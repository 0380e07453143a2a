use bytes::Bytes;

/// One broker message, verbatim.
///
/// The relay never parses the payload. Cloning is cheap (reference-counted),
/// so the same reading can be queued to every subscriber without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPayload(Bytes);

impl SensorPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Lossy UTF-8 rendering, as served by the polling endpoint.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Borrow as `&str` when the payload is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<&'static str> for SensorPayload {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

/// Single-slot cache of the most recent payload.
#[derive(Debug, Default)]
pub struct LastValueCache {
    current: Option<SensorPayload>,
}

impl LastValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached value unconditionally.
    pub fn set(&mut self, payload: SensorPayload) {
        self.current = Some(payload);
    }

    /// `None` until the first message arrives.
    pub fn get(&self) -> Option<&SensorPayload> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_first_set() {
        let cache = LastValueCache::new();
        assert!(cache.get().is_none());
    }

    #[test]
    fn last_write_wins() {
        let mut cache = LastValueCache::new();
        for reading in ["21.0", "22.4", "23.5"] {
            cache.set(SensorPayload::from(reading));
        }
        assert_eq!(cache.get(), Some(&SensorPayload::from("23.5")));
    }

    #[test]
    fn payload_is_not_interpreted() {
        let raw = SensorPayload::new(vec![0xff, 0x00, b'x']);
        assert!(raw.as_str().is_none());
        assert_eq!(raw.as_bytes().len(), 3);
        assert_eq!(raw.to_text(), "\u{fffd}\u{0}x");
    }
}
