//! Token cost of a message.

use chat_protocol::TokenUsage;

use crate::model::Message;

/// Total tokens represented by one usage record.
///
/// Cache tokens only count on top of the base when they exceed it; providers
/// disagree on whether cache reads are already inside `input`, and a cache
/// figure larger than the base cannot have been included.
pub fn usage_total(usage: &TokenUsage) -> u64 {
    match usage {
        TokenUsage::Total(total) => *total,
        TokenUsage::Breakdown(breakdown) => {
            let base = breakdown
                .input
                .saturating_add(breakdown.output)
                .saturating_add(breakdown.reasoning);
            let cache = breakdown.cache.read.saturating_add(breakdown.cache.write);
            if cache > base {
                base.saturating_add(cache)
            } else {
                base
            }
        }
    }
}

/// Tokens attributed to `message`; `0` means not yet reported.
///
/// Message-level usage wins. When it is absent or zero the most recent part
/// carrying a non-zero usage record is used instead.
pub fn extract_tokens(message: &Message) -> u64 {
    let from_info = message.info.tokens.as_ref().map(usage_total).unwrap_or(0);
    if from_info > 0 {
        return from_info;
    }

    message
        .parts
        .iter()
        .rev()
        .filter_map(|part| part.tokens())
        .map(|usage| usage_total(&usage))
        .find(|total| *total > 0)
        .unwrap_or(0)
}
