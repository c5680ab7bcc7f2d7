use std::num::NonZeroUsize;
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::config::Args;
use crate::error::{GatewayError, Result};
use crate::imaging::ImageNormalizer;
use crate::upstream::{ModelEndpoint, RetryingClient};

// Everything a request needs, built once at startup and shared behind an Arc
pub struct ServerContext {
    pub client: RetryingClient,
    pub cache: Option<ResponseCache>, // None when caching is disabled
    pub vision: ModelEndpoint,
    pub text: ModelEndpoint,
    pub normalizer: ImageNormalizer,
    pub cache_key_prefix: Option<usize>,
    pub request_timeout: Duration,
    pub max_upload_size: usize,
}

impl ServerContext {
    pub fn from_args(args: &Args) -> Result<Self> {
        args.validate()?;

        let client = RetryingClient::new(
            Duration::from_secs(args.api_timeout),
            args.max_retries,
            Duration::from_millis(args.retry_backoff_ms),
        )?;

        let cache = if args.enable_cache {
            let capacity = NonZeroUsize::new(args.cache_capacity).ok_or_else(|| {
                GatewayError::Configuration("CACHE_CAPACITY must be greater than zero".into())
            })?;
            Some(ResponseCache::new(capacity, Duration::from_secs(args.cache_ttl)))
        } else {
            None
        };

        let api_key = args.api_key.clone().filter(|k| !k.trim().is_empty());

        Ok(Self {
            client,
            cache,
            vision: ModelEndpoint {
                base_url: args.vision_base().to_string(),
                model: args.vision_model.clone(),
                api_key: api_key.clone(),
            },
            text: ModelEndpoint {
                base_url: args.text_base().to_string(),
                model: args.text_model.clone(),
                api_key,
            },
            normalizer: ImageNormalizer {
                max_file_size: args.max_file_size,
                max_edge: args.max_image_size,
                quality_threshold: args.quality_threshold,
            },
            cache_key_prefix: args.cache_key_prefix,
            request_timeout: args.request_budget(),
            max_upload_size: args.max_upload_size,
        })
    }
}
