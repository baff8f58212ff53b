//! Decodes ERC-20/721 `Transfer` events out of receipt logs.

use kepler_core::{
    models::{blockchain as chain, TokenKind},
    Bytes,
};
use tracing::debug;

use crate::rpc::codec::{topic_to_address, word_to_big};

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Token transfers and the bare token rows they imply.
///
/// Three indexed-topic slots mean ERC-20 (amount in `data`); four mean
/// ERC-721 (token id in the fourth topic). Logs that carry the transfer
/// topic but match neither shape are skipped.
pub fn decode(logs: &[chain::Log]) -> (Vec<chain::TokenTransfer>, Vec<chain::Token>) {
    let transfer_topic = Bytes::from(TRANSFER_TOPIC);

    let mut transfers = Vec::new();
    let mut tokens: Vec<chain::Token> = Vec::new();
    for log in logs {
        if log.first_topic.as_ref() != Some(&transfer_topic) {
            continue;
        }
        let (Some(from_topic), Some(to_topic)) = (&log.second_topic, &log.third_topic) else {
            debug!(
                transaction = %log.transaction_hash,
                index = log.index,
                "transfer log without indexed from/to"
            );
            continue;
        };
        let (Ok(from), Ok(to)) = (topic_to_address(from_topic), topic_to_address(to_topic))
        else {
            continue;
        };

        let (kind, amount, token_id) = match &log.fourth_topic {
            Some(id_topic) => (TokenKind::Erc721, None, Some(word_to_big(id_topic))),
            None if log.data.len() == 32 => {
                (TokenKind::Erc20, Some(word_to_big(&log.data)), None)
            }
            None => {
                debug!(
                    transaction = %log.transaction_hash,
                    index = log.index,
                    "transfer log with malformed amount"
                );
                continue;
            }
        };

        transfers.push(chain::TokenTransfer {
            transaction_hash: log.transaction_hash.clone(),
            log_index: log.index,
            block_number: log.block_number,
            from_address_hash: from,
            to_address_hash: to,
            token_contract_address_hash: log.address_hash.clone(),
            amount,
            token_id,
        });
        if !tokens
            .iter()
            .any(|t| t.contract_address_hash == log.address_hash)
        {
            tokens.push(chain::Token::uncataloged(log.address_hash.clone(), kind));
        }
    }
    (transfers, tokens)
}

#[cfg(test)]
mod test {
    use super::*;
    use bigdecimal::BigDecimal;
    use pretty_assertions::assert_eq;

    fn address_topic(n: u8) -> Bytes {
        Bytes::from(vec![n; 20]).lpad(32, 0)
    }

    fn log(
        fourth_topic: Option<Bytes>,
        data: Bytes,
    ) -> chain::Log {
        chain::Log {
            transaction_hash: Bytes::from(vec![9; 32]),
            index: 3,
            block_number: 120,
            address_hash: Bytes::from(vec![0xcc; 20]),
            data,
            first_topic: Some(Bytes::from(TRANSFER_TOPIC)),
            second_topic: Some(address_topic(1)),
            third_topic: Some(address_topic(2)),
            fourth_topic,
        }
    }

    #[test]
    fn decodes_erc20_transfer() {
        let mut amount = vec![0u8; 32];
        amount[31] = 200;
        let logs = [log(None, Bytes::from(amount))];
        let (transfers, tokens) = decode(&logs);

        assert_eq!(transfers.len(), 1);
        let transfer = &transfers[0];
        assert_eq!(transfer.from_address_hash, Bytes::from(vec![1; 20]));
        assert_eq!(transfer.to_address_hash, Bytes::from(vec![2; 20]));
        assert_eq!(transfer.amount, Some(BigDecimal::from(200)));
        assert_eq!(transfer.token_id, None);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Erc20);
        assert!(!tokens[0].cataloged);
    }

    #[test]
    fn decodes_erc721_transfer() {
        let mut id = vec![0u8; 32];
        id[31] = 7;
        let logs = [log(Some(Bytes::from(id)), Bytes::from("0x"))];
        let (transfers, tokens) = decode(&logs);

        assert_eq!(transfers[0].token_id, Some(BigDecimal::from(7)));
        assert_eq!(transfers[0].amount, None);
        assert_eq!(tokens[0].kind, TokenKind::Erc721);
    }

    #[test]
    fn ignores_unrelated_logs() {
        let mut other = log(None, Bytes::from(vec![0u8; 32]));
        other.first_topic = Some(Bytes::from(vec![0xee; 32]));
        let (transfers, tokens) = decode(&[other]);
        assert!(transfers.is_empty());
        assert!(tokens.is_empty());
    }

    #[test]
    fn one_token_row_per_contract() {
        let logs = [log(None, Bytes::from(vec![0u8; 32])), {
            let mut second = log(None, Bytes::from(vec![0u8; 32]));
            second.index = 4;
            second
        }];
        let (transfers, tokens) = decode(&logs);
        assert_eq!(transfers.len(), 2);
        assert_eq!(tokens.len(), 1);
    }
}
