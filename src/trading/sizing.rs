//! Order sizing from available balance
//! Buys spend the quote currency, sells spend the base currency.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::api::{OrderRequest, OrderType, Side};
use crate::trading::errors::TradingError;

/// Decimal places for funds on market buys
pub const FUNDS_DP: u32 = 2;
/// Decimal places for sizes
pub const SIZE_DP: u32 = 8;

/// Split `BASE-QUOTE` into its currencies
pub fn split_product(product_id: &str) -> Option<(&str, &str)> {
    let (base, quote) = product_id.split_once('-')?;
    if base.is_empty() || quote.is_empty() || quote.contains('-') {
        return None;
    }
    Some((base, quote))
}

/// Currency an order of `side` draws from
pub fn funding_currency(product_id: &str, side: Side) -> Result<&str, TradingError> {
    let (base, quote) = split_product(product_id).ok_or_else(|| TradingError::InvalidOrder {
        message: format!("product id '{}' is not of the form BASE-QUOTE", product_id),
    })?;
    Ok(match side {
        Side::Buy => quote,
        Side::Sell => base,
    })
}

fn fixed(value: Decimal, dp: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(dp);
    rounded
}

/// Fill `size` or `funds` from `available × fraction`.
///
/// Market buys get `funds`, limit buys get `size = funds / price`, sells get
/// `size`. Orders that already carry an amount are left alone.
pub fn fill_amount(
    order: &mut OrderRequest,
    available: Decimal,
    fraction: Decimal,
) -> Result<(), TradingError> {
    if order.has_amount() {
        return Ok(());
    }

    let budget = available * fraction;
    match (order.side, order.order_type) {
        (Side::Buy, OrderType::Limit) => {
            let price = order
                .price
                .filter(|p| !p.is_zero())
                .ok_or_else(|| TradingError::InvalidOrder {
                    message: "limit buy without a price cannot be sized".to_string(),
                })?;
            order.size = Some(fixed(budget / price, SIZE_DP));
        }
        (Side::Buy, OrderType::Market) => {
            order.funds = Some(fixed(budget, FUNDS_DP));
        }
        (Side::Sell, _) => {
            order.size = Some(fixed(budget, SIZE_DP));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_buy_uses_funds() {
        let mut order = OrderRequest::market("BTC-USD", Side::Buy);
        fill_amount(&mut order, dec!(100), dec!(1.0)).unwrap();
        assert_eq!(order.funds.unwrap().to_string(), "100.00");
        assert!(order.size.is_none());
    }

    #[test]
    fn test_limit_buy_divides_by_price() {
        let mut order = OrderRequest::limit("BTC-USD", Side::Buy, dec!(20));
        fill_amount(&mut order, dec!(100), dec!(0.5)).unwrap();
        assert_eq!(order.size.unwrap().to_string(), "2.50000000");
    }

    #[test]
    fn test_limit_buy_rounds_to_eight_places() {
        let mut order = OrderRequest::limit("BTC-USD", Side::Buy, dec!(3));
        fill_amount(&mut order, dec!(1), dec!(1)).unwrap();
        assert_eq!(order.size.unwrap(), dec!(0.33333333));
    }

    #[test]
    fn test_sell_uses_balance_as_size() {
        let mut order = OrderRequest::market("BTC-USD", Side::Sell);
        fill_amount(&mut order, dec!(0.75), dec!(1)).unwrap();
        assert_eq!(order.size.unwrap().to_string(), "0.75000000");
    }

    #[test]
    fn test_explicit_amount_untouched() {
        let mut order = OrderRequest::market("BTC-USD", Side::Buy).with_size(dec!(1));
        fill_amount(&mut order, dec!(100), dec!(1)).unwrap();
        assert_eq!(order.size, Some(dec!(1)));
        assert!(order.funds.is_none());
    }

    #[test]
    fn test_limit_buy_without_price_fails() {
        let mut order = OrderRequest::market("BTC-USD", Side::Buy);
        order.order_type = OrderType::Limit;
        let err = fill_amount(&mut order, dec!(100), dec!(1)).unwrap_err();
        assert!(matches!(err, TradingError::InvalidOrder { .. }));
    }

    #[test]
    fn test_funding_currency() {
        assert_eq!(funding_currency("BTC-USD", Side::Buy).unwrap(), "USD");
        assert_eq!(funding_currency("BTC-USD", Side::Sell).unwrap(), "BTC");
        assert!(funding_currency("BTCUSD", Side::Buy).is_err());
        assert!(split_product("A-B-C").is_none());
    }
}
