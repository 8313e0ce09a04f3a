use async_nats::HeaderMap;
use ebrick_events::Carrier;

/// Reads a trace carrier out of message headers.
pub fn carrier_from_headers(headers: Option<&HeaderMap>) -> Option<Carrier> {
    let carrier: Carrier = headers?
        .iter()
        .filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect();

    (!carrier.is_empty()).then_some(carrier)
}

/// Writes a trace carrier as message headers.
pub fn headers_from_carrier(carrier: &Carrier) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in carrier {
        headers.insert(name.as_str(), value.as_str());
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_carrier_survives_headers() {
        let carrier = Carrier::from([("traceparent".to_string(), TRACEPARENT.to_string())]);

        let headers = headers_from_carrier(&carrier);

        assert_eq!(
            headers.get("traceparent").map(|value| value.as_str()),
            Some(TRACEPARENT)
        );
        assert_eq!(carrier_from_headers(Some(&headers)), Some(carrier));
    }

    #[test]
    fn test_missing_or_empty_headers_have_no_carrier() {
        assert_eq!(carrier_from_headers(None), None);
        assert_eq!(carrier_from_headers(Some(&HeaderMap::new())), None);
    }
}
