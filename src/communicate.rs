use crate::config::TtsSettings;
use crate::drm::TokenGenerator;
use crate::error::{Result, TTSError};
use crate::retry::{RetryController, RetryObserver, RetryPolicy};
use crate::segmenter::{segment, TextSegmenter};
use crate::session::{ChunkSession, SessionContext, Timeline};
use crate::ssml::{MarkupProvider, SsmlMarkup, VoiceConfig};
use crate::subtitle::{SubRipBuilder, SubtitleConfig};
use crate::transport::{Connector, WebSocketConnector, DEFAULT_ENDPOINT, SEC_MS_GEC_VERSION};
use crate::TTSEvent;
use async_stream::try_stream;
use futures_util::Stream;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct CommunicateConfig {
    pub connect_timeout: Duration,
    /// Idle limit while waiting for the next frame; `None` waits forever.
    pub receive_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Collect word boundaries into subtitle cues when set.
    pub subtitle: Option<SubtitleConfig>,
}

impl Default for CommunicateConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            receive_timeout: None,
            retry: RetryPolicy::default(),
            subtitle: None,
        }
    }
}

/// Streams synthesized speech for one text.
///
/// ```no_run
/// use edge_tts_stream::{Communicate, TTSEvent, VoiceConfig};
/// use futures_util::{pin_mut, StreamExt};
///
/// # async fn run() -> edge_tts_stream::Result<()> {
/// let mut communicate = Communicate::new("Hello world", VoiceConfig::default())?;
/// let stream = communicate.stream()?;
/// pin_mut!(stream);
/// while let Some(event) = stream.next().await {
///     if let TTSEvent::Audio(bytes) = event? {
///         println!("{} bytes of audio", bytes.len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Communicate {
    voice: VoiceConfig,
    segmenter: Option<TextSegmenter>,
    markup: Arc<dyn MarkupProvider>,
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenGenerator>,
    endpoint: Url,
    gec_version: String,
    retry: RetryController,
    connect_timeout: Duration,
    receive_timeout: Option<Duration>,
    words_per_cue: Option<usize>,
    subtitles: Option<SubRipBuilder>,
    timeline: Timeline,
    stream_started: bool,
}

impl std::fmt::Debug for Communicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicate")
            .field("voice", &self.voice)
            .field("budget", &self.segmenter.as_ref().map(TextSegmenter::budget))
            .field("endpoint", &self.endpoint.as_str())
            .field("timeline", &self.timeline)
            .field("stream_started", &self.stream_started)
            .finish_non_exhaustive()
    }
}

impl Communicate {
    /// Client with the default markup, transport and settings.
    pub fn new(text: &str, voice: VoiceConfig) -> Result<Self> {
        Self::builder(text).voice(voice).build()
    }

    pub fn builder(text: &str) -> CommunicateBuilder {
        CommunicateBuilder::new(text)
    }

    pub fn voice(&self) -> &VoiceConfig {
        &self.voice
    }

    /// Chunks still to be synthesized, split on demand. Empty once
    /// [`Communicate::stream`] has been called.
    pub fn chunks(&self) -> impl Iterator<Item = String> {
        self.segmenter.clone().into_iter().flatten()
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    /// End of the last word of the last completed chunk (hundred-ns).
    pub fn total_offset(&self) -> u64 {
        self.timeline.total_offset
    }

    /// Synthesize every chunk in order.
    ///
    /// May be called once per client; a second call fails with
    /// [`TTSError::Usage`] without opening a connection.
    pub fn stream(&mut self) -> Result<impl Stream<Item = Result<TTSEvent>> + Send + '_> {
        if self.stream_started {
            return Err(TTSError::Usage(
                "stream() can only be called once per client".to_string(),
            ));
        }
        self.stream_started = true;
        let chunks = self.segmenter.take();
        log::info!("🗣️ Starting synthesis");

        Ok(try_stream! {
            for (index, chunk) in chunks.into_iter().flatten().enumerate() {
                if chunk.trim().is_empty() {
                    log::debug!("Skipping whitespace-only chunk {}", index + 1);
                    continue;
                }

                log::debug!("📝 Chunk {} ({} bytes)", index + 1, chunk.len());
                let markup = self.markup.render(&self.voice, &chunk);
                let ctx = SessionContext {
                    connector: self.connector.as_ref(),
                    tokens: self.tokens.as_ref(),
                    endpoint: &self.endpoint,
                    gec_version: &self.gec_version,
                    retry: &self.retry,
                    connect_timeout: self.connect_timeout,
                    receive_timeout: self.receive_timeout,
                };
                let mut session = ChunkSession::open(&ctx, &markup, self.timeline).await?;

                while let Some(event) = session.next_event().await? {
                    if let Some(builder) = self.subtitles.as_mut() {
                        if matches!(&event, TTSEvent::WordBoundary { text, .. } if !text.is_empty()) {
                            builder.add_cue(&event)?;
                        }
                    }
                    yield event;
                }

                self.timeline = session.finish().await;
                log::debug!("✅ Chunk {} done (offset compensation {})", index + 1, self.timeline.offset_compensation);
            }
            log::info!("✅ Synthesis complete");
        })
    }

    /// Merge the collected cues and render them as SubRip.
    pub fn subtitles(&mut self) -> Result<String> {
        let words_per_cue = self.words_per_cue;
        let builder = self.subtitles.as_mut().ok_or_else(|| {
            TTSError::Usage("Subtitles were not enabled for this client".to_string())
        })?;
        if let Some(words_per_cue) = words_per_cue {
            builder.merge_cues(words_per_cue)?;
        }
        Ok(builder.generate())
    }
}

pub struct CommunicateBuilder {
    text: String,
    voice: VoiceConfig,
    config: CommunicateConfig,
    markup: Arc<dyn MarkupProvider>,
    connector: Arc<dyn Connector>,
    tokens: Option<Arc<TokenGenerator>>,
    retry_observer: Option<Arc<dyn RetryObserver>>,
    endpoint: String,
    gec_version: String,
}

impl CommunicateBuilder {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            voice: VoiceConfig::default(),
            config: CommunicateConfig::default(),
            markup: Arc::new(SsmlMarkup),
            connector: Arc::new(WebSocketConnector),
            tokens: None,
            retry_observer: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            gec_version: SEC_MS_GEC_VERSION.to_string(),
        }
    }

    pub fn voice(mut self, voice: VoiceConfig) -> Self {
        self.voice = voice;
        self
    }

    pub fn config(mut self, config: CommunicateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn markup(mut self, markup: Arc<dyn MarkupProvider>) -> Self {
        self.markup = markup;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Share a token generator (and its clock skew) between clients.
    pub fn token_generator(mut self, tokens: Arc<TokenGenerator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn retry_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.retry_observer = Some(observer);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Apply endpoint, token, timeouts, retries and cue size from settings.
    pub fn settings(mut self, settings: &TtsSettings) -> Self {
        self.endpoint = settings.endpoint.to_string();
        self.gec_version = settings.gec_version.clone();
        self.tokens = Some(Arc::new(settings.token_generator()));
        self.config = settings.communicate_config();
        self
    }

    pub fn build(self) -> Result<Communicate> {
        let voice = self.voice.validated()?;
        let endpoint = Url::parse(&self.endpoint).map_err(|e| {
            TTSError::Configuration(format!("Invalid endpoint {}: {}", self.endpoint, e))
        })?;

        let prepared = self.markup.prepare_text(&self.text);
        let budget = self.markup.max_chunk_bytes(&voice);
        let segmenter = segment(&prepared, budget)?;
        log::debug!(
            "Chunking {} bytes of text into pieces of at most {} bytes",
            prepared.len(),
            budget
        );

        let retry = match self.retry_observer {
            Some(observer) => RetryController::with_observer(self.config.retry, observer),
            None => RetryController::new(self.config.retry),
        };

        Ok(Communicate {
            voice,
            segmenter: Some(segmenter),
            markup: self.markup,
            connector: self.connector,
            tokens: self.tokens.unwrap_or_default(),
            endpoint,
            gec_version: self.gec_version,
            retry,
            connect_timeout: self.config.connect_timeout,
            receive_timeout: self.config.receive_timeout,
            words_per_cue: self.config.subtitle.as_ref().map(|s| s.words_per_cue),
            subtitles: self.config.subtitle.map(|_| SubRipBuilder::new()),
            timeline: Timeline::default(),
            stream_started: false,
        })
    }
}
