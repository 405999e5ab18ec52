use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use num_traits::Zero;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::AppError;
use crate::utils::math::parse_price;
use crate::utils::time::parse_day;

/// Unit prices per (coin id, day). A missing entry prices the asset at zero.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<(u64, NaiveDate), BigDecimal>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::ConfigError(format!("Cannot read price file {}: {}", path.display(), e)))?;
        let table = Self::parse(&contents)?;
        info!(path = %path.display(), entries = table.len(), "Loaded price table");
        Ok(table)
    }

    /// One `<coin_id> <YYYY-MM-DD> <price>` entry per line, separated by whitespace or commas.
    /// Blank lines and `#` comments are skipped. Later entries override earlier ones.
    pub fn parse(contents: &str) -> Result<Self, AppError> {
        let mut table = Self::new();

        for (number, line) in contents.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let bad_line = |message: String| AppError::ConfigError(format!("Price file line {}: {}", number + 1, message));

            let fields: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|field| !field.is_empty())
                .collect();
            let [coin_id, day, price] = fields.as_slice() else {
                return Err(bad_line(format!("expected 3 fields, found {}", fields.len())));
            };

            let coin_id = coin_id
                .parse::<u64>()
                .map_err(|_| bad_line(format!("coin id is not a number: {}", coin_id)))?;
            let day = parse_day(day).map_err(|e| bad_line(e.to_string()))?;
            let price = parse_price(price).map_err(|e| bad_line(e.to_string()))?;

            table.insert(coin_id, day, price);
        }
        Ok(table)
    }

    pub fn insert(&mut self, coin_id: u64, day: NaiveDate, price: BigDecimal) {
        self.prices.insert((coin_id, day), price);
    }

    pub fn price(&self, coin_id: u64, day: NaiveDate) -> BigDecimal {
        self.prices.get(&(coin_id, day)).cloned().unwrap_or_else(BigDecimal::zero)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::str::FromStr;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    #[test]
    fn test_parse_mixed_separators_and_comments() {
        let table = PriceTable::parse(
            "# coin date price\n\
             825 2021-01-01 1.0001\n\
             \n\
             5567,2021-01-01,2.50   # celo\n\
             5567\t2021-01-02  2.75\n",
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.price(5567, day("2021-01-01")), BigDecimal::from_str("2.50").unwrap());
        assert_eq!(table.price(825, day("2021-01-01")), BigDecimal::from_str("1.0001").unwrap());
    }

    #[test]
    fn test_missing_price_is_zero() {
        let table = PriceTable::parse("825 2021-01-01 1.0").unwrap();
        assert!(table.price(825, day("2021-01-02")).is_zero());
        assert!(table.price(1, day("2021-01-01")).is_zero());
    }

    #[test]
    fn test_malformed_line_names_line_number() {
        let err = PriceTable::parse("825 2021-01-01 1.0\n825 2021-13-01 1.0\n").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(ref msg) if msg.contains("line 2")));

        assert!(PriceTable::parse("abc 2021-01-01 1.0").is_err());
        assert!(PriceTable::parse("825 2021-01-01").is_err());
        assert!(PriceTable::parse("825 2021-01-01 cheap").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "3408 2022-03-01 0.9998").unwrap();

        let table = PriceTable::load(file.path()).await.unwrap();
        assert_eq!(table.price(3408, day("2022-03-01")), BigDecimal::from_str("0.9998").unwrap());

        assert!(PriceTable::load("/nonexistent/prices.txt").await.is_err());
    }
}
