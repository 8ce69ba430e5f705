pub mod crypto;
pub mod macro_series;

pub use crypto::CryptoCollector;
pub use macro_series::MacroCollector;

#[cfg(test)]
mod tests {
    use common::OhlcCollector;

    use crate::crypto::CryptoCollector;

    #[tokio::test]
    async fn rejects_when_upstream_unreachable() {
        let collector = CryptoCollector::new("http://127.0.0.1:1", None);
        let result = collector.collect_ohlc("BTC", None).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, common::ErrorKind::Network);
    }
}
