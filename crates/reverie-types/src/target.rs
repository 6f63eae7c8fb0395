/// Addressing for an outgoing call or send.
///
/// `key` selects the virtual object / workflow instance for keyed services
/// and stays `None` for plain services. Headers ride along unmodified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Target {
    pub service: String,
    pub handler: String,
    pub key: Option<String>,
    pub idempotency_key: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Target {
    /// Target a plain (stateless) service handler.
    pub fn service(service: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            ..Default::default()
        }
    }

    /// Target a keyed (virtual object or workflow) handler.
    pub fn keyed(
        service: impl Into<String>,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_target_carries_key_and_options() {
        let t = Target::keyed("Counter", "c1", "add")
            .idempotency_key("k1")
            .header("x-tenant", "acme");
        assert_eq!(t.service, "Counter");
        assert_eq!(t.key.as_deref(), Some("c1"));
        assert_eq!(t.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(t.headers.len(), 1);
    }
}
