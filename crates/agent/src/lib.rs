//! The conversation agent: the run loop behind every question.
//!
//! A turn follows a **Query → Call → Observe** cycle:
//!
//! 1. **Receive** a user query and the context it is about
//! 2. **Build the request** (preamble + facts + declared functions + transcript)
//! 3. **Stream** the model's reply, forwarding partial answers
//! 4. **If function calls**: run them (or reuse cached results), append results, loop back to step 3
//! 5. **If text only**: parse the answer and commit the turn to history
//!
//! The loop ends on a final answer, a terminal error, cancellation or the
//! step limit.

pub mod cache;
pub mod conversation;
pub mod enhancer;
pub mod response;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use cache::{CachedResult, FunctionResultCache};
pub use conversation::{ConversationAgent, RunOptions, TurnOutcome};
pub use enhancer::{ShownObjects, enhance_query};
pub use response::{ANSWER_FENCE, ResponseParser, strip_fence};
pub use stream_event::ResponseData;
