//! Type conversions between internal types and proto types

use tonic::{Code, Status};

use currency_core::{
    CurrencyCode, CurrencyPair, RateError, RateQuote, StreamErrorCode, StreamMessage,
    SubscriptionError,
};

use crate::proto::streaming_rate_response::Message;
use crate::proto::{self, Currencies, RateRequest, RateResponse, StreamingRateResponse};

impl TryFrom<Currencies> for CurrencyCode {
    type Error = RateError;

    fn try_from(currency: Currencies) -> Result<Self, Self::Error> {
        CurrencyCode::new(currency.as_str_name())
    }
}

impl TryFrom<CurrencyCode> for Currencies {
    type Error = RateError;

    fn try_from(code: CurrencyCode) -> Result<Self, Self::Error> {
        Currencies::from_str_name(code.as_str())
            .ok_or_else(|| RateError::InvalidCurrencyCode(code.to_string()))
    }
}

/// Decode a wire enum value into a currency code
pub fn currency_from_i32(value: i32) -> Result<CurrencyCode, RateError> {
    let currency = Currencies::try_from(value)
        .map_err(|_| RateError::InvalidCurrencyCode(format!("enum value {value}")))?;
    CurrencyCode::try_from(currency)
}

pub fn currency_to_i32(code: CurrencyCode) -> Result<i32, RateError> {
    Currencies::try_from(code).map(|c| c as i32)
}

impl TryFrom<RateRequest> for CurrencyPair {
    type Error = RateError;

    fn try_from(req: RateRequest) -> Result<Self, Self::Error> {
        Ok(CurrencyPair::new(
            currency_from_i32(req.base)?,
            currency_from_i32(req.destination)?,
        ))
    }
}

impl TryFrom<CurrencyPair> for RateRequest {
    type Error = RateError;

    fn try_from(pair: CurrencyPair) -> Result<Self, Self::Error> {
        Ok(RateRequest {
            base: currency_to_i32(pair.base)?,
            destination: currency_to_i32(pair.destination)?,
        })
    }
}

/// Wire form of a pair, falling back to the default enum value for codes
/// the protocol does not know. Only pairs decoded from requests reach the
/// outbound path, so the fallback is not hit in practice.
fn pair_to_request(pair: CurrencyPair) -> RateRequest {
    RateRequest::try_from(pair).unwrap_or_default()
}

impl From<RateQuote> for RateResponse {
    fn from(quote: RateQuote) -> Self {
        let req = pair_to_request(quote.pair);
        RateResponse {
            base: req.base,
            destination: req.destination,
            rate: quote.rate,
        }
    }
}

pub fn stream_code_to_grpc(code: StreamErrorCode) -> Code {
    match code {
        StreamErrorCode::InvalidArgument => Code::InvalidArgument,
        StreamErrorCode::NotFound => Code::NotFound,
    }
}

pub fn grpc_code_to_stream(code: Code) -> StreamErrorCode {
    match code {
        Code::NotFound => StreamErrorCode::NotFound,
        _ => StreamErrorCode::InvalidArgument,
    }
}

impl From<SubscriptionError> for proto::SubscriptionError {
    fn from(err: SubscriptionError) -> Self {
        proto::SubscriptionError {
            code: stream_code_to_grpc(err.code) as i32,
            message: err.message,
            detail: err.pair.map(pair_to_request),
        }
    }
}

impl From<StreamMessage> for StreamingRateResponse {
    fn from(message: StreamMessage) -> Self {
        let message = match message {
            StreamMessage::Rate(quote) => Message::RateResponse(quote.into()),
            StreamMessage::Error(err) => Message::Error(err.into()),
        };
        StreamingRateResponse {
            message: Some(message),
        }
    }
}

impl TryFrom<StreamingRateResponse> for StreamMessage {
    type Error = RateError;

    fn try_from(resp: StreamingRateResponse) -> Result<Self, RateError> {
        match resp.message {
            Some(Message::RateResponse(r)) => {
                let pair = CurrencyPair::new(
                    currency_from_i32(r.base)?,
                    currency_from_i32(r.destination)?,
                );
                Ok(StreamMessage::Rate(RateQuote::new(pair, r.rate)))
            }
            Some(Message::Error(e)) => {
                let pair = e.detail.map(CurrencyPair::try_from).transpose()?;
                Ok(StreamMessage::Error(SubscriptionError {
                    code: grpc_code_to_stream(Code::from_i32(e.code)),
                    message: e.message,
                    pair,
                }))
            }
            None => Err(RateError::InvalidCurrencyCode("empty stream message".to_string())),
        }
    }
}

/// Map a rate error onto the gRPC status returned to callers
pub fn rate_error_to_status(err: RateError) -> Status {
    match err {
        RateError::UnknownCurrency(_) => Status::not_found(err.to_string()),
        RateError::InvalidArgument { .. } | RateError::InvalidCurrencyCode(_) => {
            Status::invalid_argument(err.to_string())
        }
        RateError::AlreadySubscribed(_) => Status::already_exists(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_round_trip_through_enum() {
        assert_eq!(currency_from_i32(Currencies::Gbp as i32).unwrap(), CurrencyCode::GBP);
        assert_eq!(currency_to_i32(CurrencyCode::USD).unwrap(), Currencies::Usd as i32);
        assert!(currency_from_i32(999).is_err());

        let unsupported = CurrencyCode::new("XAU").unwrap();
        assert!(Currencies::try_from(unsupported).is_err());
    }

    #[test]
    fn test_request_to_pair() {
        let req = RateRequest {
            base: Currencies::Gbp as i32,
            destination: Currencies::Usd as i32,
        };
        let pair = CurrencyPair::try_from(req).unwrap();
        assert_eq!(pair, CurrencyPair::new(CurrencyCode::GBP, CurrencyCode::USD));
    }

    #[test]
    fn test_in_band_error_message() {
        let pair = CurrencyPair::new(CurrencyCode::EUR, CurrencyCode::USD);
        let resp = StreamingRateResponse::from(StreamMessage::Error(
            SubscriptionError::already_subscribed(pair),
        ));

        match resp.message {
            Some(Message::Error(ref e)) => {
                assert_eq!(e.code, Code::InvalidArgument as i32);
                assert_eq!(e.message, "Subscription already active for rate");
                assert_eq!(
                    e.detail,
                    Some(RateRequest {
                        base: Currencies::Eur as i32,
                        destination: Currencies::Usd as i32,
                    })
                );
            }
            ref other => panic!("unexpected message {other:?}"),
        }

        let back = StreamMessage::try_from(resp).unwrap();
        assert_eq!(back.pair(), Some(pair));
    }

    #[test]
    fn test_streaming_rate_message_decodes() {
        let resp = StreamingRateResponse {
            message: Some(Message::RateResponse(RateResponse {
                base: Currencies::Gbp as i32,
                destination: Currencies::Usd as i32,
                rate: 1.25,
            })),
        };

        let message = StreamMessage::try_from(resp).unwrap();
        assert_eq!(
            message,
            StreamMessage::Rate(RateQuote::new(
                CurrencyPair::new(CurrencyCode::GBP, CurrencyCode::USD),
                1.25
            ))
        );

        let empty = StreamingRateResponse { message: None };
        assert!(StreamMessage::try_from(empty).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let status = rate_error_to_status(RateError::UnknownCurrency(CurrencyCode::JPY));
        assert_eq!(status.code(), Code::NotFound);

        let status = rate_error_to_status(RateError::InvalidArgument {
            base: CurrencyCode::EUR,
            destination: CurrencyCode::EUR,
        });
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(
            status.message(),
            "Base rate EUR can not be equal to destination rate EUR"
        );
    }
}
