//! Minimal Cloud Firestore writer.
//!
//! Authenticates as a Google service account (OAuth2 JWT bearer grant) and
//! creates one document per reading through the Firestore REST API.

use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::prelude::*;
use log::{debug, info};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::measurement::Reading;
use crate::store::Store;

pub const FIRESTORE_HOST: &str = "https://firestore.googleapis.com";
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// The fields of a service-account key file that are needed to authenticate.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccount {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|err| {
            StoreError::Credentials(format!("cannot read {}: {}", path.display(), err))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            StoreError::Credentials(format!(
                "{} is not a service account key: {}",
                path.display(),
                err
            ))
        })
    }

    fn key_pair(&self) -> Result<RsaKeyPair, StoreError> {
        let keys = rustls_pemfile::pkcs8_private_keys(&mut self.private_key.as_bytes())?;
        let der = keys
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Credentials("no PKCS#8 private key in key file".into()))?;
        RsaKeyPair::from_pkcs8(&der)
            .map_err(|err| StoreError::Credentials(format!("private key rejected: {}", err)))
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    scope: &'a str,
    iat: i64,
    exp: i64,
}

impl<'a> Claims<'a> {
    fn new(account: &'a ServiceAccount, issued_at: i64) -> Self {
        Claims {
            iss: &account.client_email,
            sub: &account.client_email,
            aud: &account.token_uri,
            scope: DATASTORE_SCOPE,
            iat: issued_at,
            exp: issued_at + TOKEN_LIFETIME_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Still usable at `now`, with a margin so it cannot lapse mid-request.
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now
    }
}

/// How requests are authorized.
enum Auth {
    ServiceAccount {
        account: ServiceAccount,
        key_pair: RsaKeyPair,
        rng: SystemRandom,
        token: Option<AccessToken>,
    },
    /// The local emulator accepts any bearer token.
    Emulator,
}

pub struct FirestoreStore {
    agent: ureq::Agent,
    auth: Auth,
    documents_url: String,
}

impl FirestoreStore {
    /// Connects with the service account key at `credentials`.
    ///
    /// `project` overrides the key file's `project_id`.
    pub fn connect(
        credentials: &Path,
        project: Option<&str>,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let account = ServiceAccount::load(credentials)?;
        let project = match project {
            Some(project) => project.to_string(),
            None => account.project_id.clone().ok_or_else(|| {
                StoreError::Credentials("key file has no project_id; set a project".into())
            })?,
        };
        let key_pair = account.key_pair()?;
        info!(
            "writing to firestore project {} collection {} as {}",
            project, collection, account.client_email
        );
        Ok(FirestoreStore {
            agent: agent(timeout),
            auth: Auth::ServiceAccount {
                account,
                key_pair,
                rng: SystemRandom::new(),
                token: None,
            },
            documents_url: documents_url(FIRESTORE_HOST, &project, collection),
        })
    }

    /// Talks to a Firestore emulator at `host` (`FIRESTORE_EMULATOR_HOST`).
    ///
    /// No credentials are needed.
    pub fn emulator(host: &str, project: &str, collection: &str, timeout: Duration) -> Self {
        info!("writing to firestore emulator at {}", host);
        FirestoreStore {
            agent: agent(timeout),
            auth: Auth::Emulator,
            documents_url: documents_url(&format!("http://{}", host), project, collection),
        }
    }

    fn bearer(&mut self) -> Result<String, StoreError> {
        match &mut self.auth {
            Auth::Emulator => Ok("owner".to_string()),
            Auth::ServiceAccount {
                account,
                key_pair,
                rng,
                token,
            } => {
                let now = Utc::now();
                if let Some(current) = token.as_ref().filter(|current| current.is_fresh(now)) {
                    return Ok(current.value.clone());
                }
                let assertion = sign_assertion(account, key_pair, rng, now.timestamp())?;
                let fresh = fetch_token(&self.agent, &account.token_uri, &assertion)?;
                let value = fresh.access_token.clone();
                debug!("obtained access token valid for {}s", fresh.expires_in);
                *token = Some(AccessToken {
                    value: fresh.access_token,
                    expires_at: now + chrono::Duration::seconds(fresh.expires_in),
                });
                Ok(value)
            }
        }
    }
}

impl Store for FirestoreStore {
    fn write(&mut self, reading: &Reading) -> Result<(), StoreError> {
        let bearer = self.bearer()?;
        let response = self
            .agent
            .post(&self.documents_url)
            .set("Authorization", &format!("Bearer {}", bearer))
            .send_json(document_body(reading))?;
        let created: Value = response.into_json()?;
        debug!("created {}", created["name"].as_str().unwrap_or("document"));
        Ok(())
    }
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

/// Collection endpoint; Firestore assigns the document id on POST.
pub fn documents_url(host: &str, project: &str, collection: &str) -> String {
    format!(
        "{}/v1/projects/{}/databases/(default)/documents/{}",
        host, project, collection
    )
}

/// Document payload in Firestore's typed-value encoding.
pub fn document_body(reading: &Reading) -> Value {
    json!({
        "fields": {
            "device": { "stringValue": reading.device },
            "pm2.5": { "doubleValue": reading.pm2_5 },
            "pm10": { "doubleValue": reading.pm10 },
            "time": {
                "timestampValue": reading.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
            }
        }
    })
}

fn encode_segment<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

fn sign_assertion(
    account: &ServiceAccount,
    key_pair: &RsaKeyPair,
    rng: &SystemRandom,
    issued_at: i64,
) -> Result<String, StoreError> {
    let header = encode_segment(&json!({ "alg": "RS256", "typ": "JWT" }))?;
    let claims = encode_segment(&Claims::new(account, issued_at))?;
    let message = format!("{}.{}", header, claims);

    let mut signature = vec![0; key_pair.public().modulus_len()];
    key_pair
        .sign(&RSA_PKCS1_SHA256, rng, message.as_bytes(), &mut signature)
        .map_err(|_| StoreError::Auth("could not sign token request".into()))?;
    Ok(format!("{}.{}", message, URL_SAFE_NO_PAD.encode(signature)))
}

fn fetch_token(
    agent: &ureq::Agent,
    token_uri: &str,
    assertion: &str,
) -> Result<TokenResponse, StoreError> {
    let response = agent
        .post(token_uri)
        .send_form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
        .map_err(|err| match err {
            ureq::Error::Status(code, response) => StoreError::Auth(format!(
                "token endpoint returned {}: {}",
                code,
                response.into_string().unwrap_or_default()
            )),
            other => StoreError::from(other),
        })?;
    Ok(response.into_json()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Sample;
    use ring::signature::{KeyPair, UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const TEST_KEY: &str = include_str!("../tests/fixtures/throwaway_rsa_pkcs8.pem");

    fn account() -> ServiceAccount {
        ServiceAccount {
            client_email: "sampler@demo.iam.gserviceaccount.com".into(),
            private_key: String::new(),
            token_uri: DEFAULT_TOKEN_URI.into(),
            project_id: Some("demo".into()),
        }
    }

    #[test]
    fn documents_url_targets_default_database() {
        assert_eq!(
            documents_url(FIRESTORE_HOST, "demo", "readings"),
            "https://firestore.googleapis.com\
             /v1/projects/demo/databases/(default)/documents/readings"
        );
    }

    #[test]
    fn document_body_uses_typed_values() {
        let sample = Sample {
            pm2_5: 12.3,
            pm10: 25.6,
            device_id: [0xa1, 0x60],
        };
        let at = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let body = document_body(&Reading::new(&sample, "a160".into(), at));

        let fields = &body["fields"];
        assert_eq!(fields["device"]["stringValue"], "a160");
        assert_eq!(fields["pm2.5"]["doubleValue"], 12.3);
        assert_eq!(fields["pm10"]["doubleValue"], 25.6);
        assert_eq!(
            fields["time"]["timestampValue"],
            "2020-01-02T03:04:05.000000Z"
        );
    }

    #[test]
    fn claims_cover_one_hour() {
        let account = account();
        let claims = Claims::new(&account, 1_000);
        assert_eq!(claims.iss, account.client_email);
        assert_eq!(claims.aud, DEFAULT_TOKEN_URI);
        assert_eq!(claims.scope, DATASTORE_SCOPE);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn key_file_without_token_uri_uses_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"type":"service_account","client_email":"a@b.c","private_key":"x"}}"#
        )
        .unwrap();

        let account = ServiceAccount::load(file.path()).unwrap();
        assert_eq!(account.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(account.project_id, None);
    }

    #[test]
    fn missing_key_file_is_a_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ServiceAccount::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(StoreError::Credentials(_))));
    }

    #[test]
    fn key_file_without_pem_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"client_email":"a@b.c","private_key":"not a key","project_id":"demo"}}"#
        )
        .unwrap();

        let result = FirestoreStore::connect(file.path(), None, "readings", Duration::from_secs(5));
        assert!(matches!(result, Err(StoreError::Credentials(_))));
    }

    fn keyed_account(token_uri: &str) -> ServiceAccount {
        ServiceAccount {
            private_key: TEST_KEY.into(),
            token_uri: token_uri.into(),
            ..account()
        }
    }

    fn reading() -> Reading {
        let sample = Sample {
            pm2_5: 1.5,
            pm10: 3.0,
            device_id: [0x12, 0x34],
        };
        let at = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        Reading::new(&sample, sample.device_hex(), at)
    }

    fn read_request(reader: &mut impl BufRead) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            head.push_str(&line);
        }
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();
        head + "\r\n" + &String::from_utf8_lossy(&body)
    }

    /// Answers one connection per canned response and hands back the requests it saw.
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                requests.push(read_request(&mut reader));
                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .unwrap();
            }
            requests
        });
        (host, handle)
    }

    fn header_value<'a>(request: &'a str, name: &str) -> Option<&'a str> {
        request
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    }

    #[test]
    fn assertion_is_a_verifiable_rs256_jwt() {
        let account = keyed_account(DEFAULT_TOKEN_URI);
        let key_pair = account.key_pair().unwrap();
        let assertion = sign_assertion(&account, &key_pair, &SystemRandom::new(), 1_000).unwrap();

        let segments: Vec<&str> = assertion.split('.').collect();
        assert_eq!(segments.len(), 3);

        let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[0]).unwrap())
            .unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["typ"], "JWT");

        let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap())
            .unwrap();
        assert_eq!(claims["iss"], account.client_email.as_str());
        assert_eq!(claims["aud"], DEFAULT_TOKEN_URI);
        assert_eq!(claims["iat"], 1_000);
        assert_eq!(claims["exp"], 4_600);

        let signature = URL_SAFE_NO_PAD.decode(segments[2]).unwrap();
        let message = format!("{}.{}", segments[0], segments[1]);
        UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, key_pair.public_key().as_ref())
            .verify(message.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn token_is_refreshed_within_the_margin() {
        let now = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let token = |secs_left: i64| AccessToken {
            value: "t".into(),
            expires_at: now + chrono::Duration::seconds(secs_left),
        };

        assert!(token(3600).is_fresh(now));
        assert!(token(61).is_fresh(now));
        assert!(!token(60).is_fresh(now));
        assert!(!token(10).is_fresh(now));
        assert!(!token(-5).is_fresh(now));
    }

    #[test]
    fn emulator_writes_with_owner_bearer() {
        let (host, server) = serve(vec![
            (200, r#"{"name":"projects/demo/databases/(default)/documents/readings/abc"}"#),
            (503, "unavailable"),
        ]);
        let mut store = FirestoreStore::emulator(&host, "demo", "readings", Duration::from_secs(5));

        store.write(&reading()).unwrap();
        match store.write(&reading()) {
            Err(StoreError::Status { code, body }) => {
                assert_eq!(code, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected {:?}", other),
        }

        let requests = server.join().unwrap();
        let first = &requests[0];
        assert!(first.starts_with("POST /v1/projects/demo/databases/"));
        assert!(first.contains("/documents/readings "));
        assert_eq!(header_value(first, "authorization"), Some("Bearer owner"));
        let body: Value = serde_json::from_str(first.split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body, document_body(&reading()));
    }

    #[test]
    fn service_account_token_is_fetched_once_and_reused() {
        let (host, server) = serve(vec![
            (200, r#"{"access_token":"tok-1","expires_in":3600,"token_type":"Bearer"}"#),
            (200, r#"{"name":"doc-1"}"#),
            (200, r#"{"name":"doc-2"}"#),
        ]);
        let account = keyed_account(&format!("http://{}/token", host));
        let key_pair = account.key_pair().unwrap();
        let mut store = FirestoreStore {
            agent: agent(Duration::from_secs(5)),
            auth: Auth::ServiceAccount {
                account,
                key_pair,
                rng: SystemRandom::new(),
                token: None,
            },
            documents_url: documents_url(&format!("http://{}", host), "demo", "readings"),
        };

        store.write(&reading()).unwrap();
        store.write(&reading()).unwrap();

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("POST /token "));
        let form = requests[0].split("\r\n\r\n").nth(1).unwrap();
        assert!(form.contains("grant-type%3Ajwt-bearer"));
        assert!(form.contains("assertion="));
        assert_eq!(requests.len(), 3);
        for document in &requests[1..] {
            assert_eq!(header_value(document, "authorization"), Some("Bearer tok-1"));
        }
    }

    #[test]
    fn rejected_token_request_is_an_auth_error() {
        let (host, server) = serve(vec![(400, r#"{"error":"invalid_grant"}"#)]);
        let account = keyed_account(&format!("http://{}/token", host));
        let assertion = sign_assertion(
            &account,
            &account.key_pair().unwrap(),
            &SystemRandom::new(),
            1_000,
        )
        .unwrap();

        let result = fetch_token(&agent(Duration::from_secs(5)), &account.token_uri, &assertion);
        match result {
            Err(StoreError::Auth(message)) => assert!(message.contains("invalid_grant")),
            other => panic!("unexpected {:?}", other),
        }
        server.join().unwrap();
    }
}
