//! Scripted agent capability for tests. Each scripted turn is emitted as
//! an `Assistant` message, its tool blocks are actually invoked against
//! the toolbox, and a `ToolResults` boundary follows when any tool ran.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use quarry_core::messages::{AssistantBlock, ReasonerMessage};
use quarry_core::reasoner::{
    MessageStream, Reasoner, ReasonerError, ReasonerLimits, ReasonerRequest,
};
use quarry_core::tools::{AnalysisTools, ToolReply, TOOL_EXECUTE_CODE, TOOL_LOAD_RESULT};

/// One content block of a scripted turn.
#[derive(Clone, Debug)]
pub enum MockBlock {
    Text(String),
    ExecuteCode(String),
    LoadResult(String),
}

/// One scripted event of a mock run.
#[derive(Clone, Debug)]
pub enum MockEvent {
    Turn(Vec<MockBlock>),
    /// Mid-stream fault; ends the stream with an `Err` item.
    Fault(String),
}

impl MockEvent {
    /// A turn containing a single text block.
    pub fn text_turn(text: impl Into<String>) -> Self {
        Self::Turn(vec![MockBlock::Text(text.into())])
    }
}

pub struct MockReasoner {
    script: Vec<MockEvent>,
    fail_on_start: Option<String>,
    requests: Arc<Mutex<Vec<ReasonerRequest>>>,
    replies: Arc<Mutex<Vec<ToolReply>>>,
}

impl MockReasoner {
    pub fn new(script: Vec<MockEvent>) -> Self {
        Self {
            script,
            fail_on_start: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A capability whose `run` fails outright.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            script: Vec::new(),
            fail_on_start: Some(message.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Requests observed by `run`, in call order.
    pub fn requests(&self) -> Vec<ReasonerRequest> {
        self.requests.lock().clone()
    }

    /// Tool replies observed so far, in call order.
    pub fn replies(&self) -> Vec<ToolReply> {
        self.replies.lock().clone()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(
        &self,
        request: ReasonerRequest,
        tools: Arc<dyn AnalysisTools>,
        limits: &ReasonerLimits,
    ) -> Result<MessageStream, ReasonerError> {
        self.requests.lock().push(request);
        if let Some(message) = &self.fail_on_start {
            return Err(ReasonerError::Unavailable(message.clone()));
        }

        // Truncate at the turn limit; faults always pass through.
        let mut turns = 0u32;
        let script: Vec<MockEvent> = self
            .script
            .iter()
            .filter(|event| match event {
                MockEvent::Turn(_) => {
                    turns += 1;
                    turns <= limits.max_turns
                }
                MockEvent::Fault(_) => true,
            })
            .cloned()
            .collect();

        let replies = self.replies.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in script {
                match event {
                    MockEvent::Turn(blocks) => {
                        let assistant: Vec<AssistantBlock> = blocks
                            .iter()
                            .map(|block| match block {
                                MockBlock::Text(text) => AssistantBlock::text(text.clone()),
                                MockBlock::ExecuteCode(code) => AssistantBlock::tool_use(
                                    TOOL_EXECUTE_CODE,
                                    json!({ "code": code }),
                                ),
                                MockBlock::LoadResult(uid) => AssistantBlock::tool_use(
                                    TOOL_LOAD_RESULT,
                                    json!({ "uid": uid }),
                                ),
                            })
                            .collect();
                        if tx
                            .send(Ok(ReasonerMessage::Assistant { blocks: assistant }))
                            .await
                            .is_err()
                        {
                            return;
                        }

                        let mut used_tools = false;
                        for block in &blocks {
                            match block {
                                MockBlock::Text(_) => {}
                                MockBlock::ExecuteCode(code) => {
                                    used_tools = true;
                                    let reply = tools.execute_code(code).await;
                                    replies.lock().push(reply);
                                }
                                MockBlock::LoadResult(uid) => {
                                    used_tools = true;
                                    let reply = tools.load_result(uid).await;
                                    replies.lock().push(reply);
                                }
                            }
                        }
                        if used_tools
                            && tx.send(Ok(ReasonerMessage::ToolResults)).await.is_err()
                        {
                            return;
                        }
                    }
                    MockEvent::Fault(message) => {
                        let _ = tx.send(Err(ReasonerError::Interrupted(message))).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
