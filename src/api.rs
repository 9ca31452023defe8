use std::{net::IpAddr, str::FromStr, sync::Arc};

use image::DynamicImage;
use rocket::{
    Build, Config, FromForm, Rocket, State,
    data::{ByteUnit, Limits},
    form::Form,
    fs::TempFile,
    get,
    http::{ContentType, Status},
    post,
    response::content::RawHtml,
    routes,
    serde::json::Json,
};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, sync::Mutex};
use tracing::{error, warn};

use crate::{
    grounding::Grounder,
    utils::img_utils::{get_image_from_data_url, load_image_from_bytes},
};

pub type SharedGrounder = Arc<Mutex<Grounder>>;

type ApiError = (Status, String);

const INDEX_HTML: &str = include_str!("../assets/index.html");

pub fn server_config(address: &str, port: u16) -> anyhow::Result<Config> {
    Ok(Config {
        address: IpAddr::from_str(address)?,
        port,
        limits: Limits::default()
            .limit("string", ByteUnit::Mebibyte(5))
            .limit("json", ByteUnit::Mebibyte(50))
            .limit("data-form", ByteUnit::Mebibyte(100))
            .limit("file", ByteUnit::Mebibyte(100)),
        ..Config::default()
    })
}

pub fn build_rocket(grounder: Grounder, config: Config) -> Rocket<Build> {
    rocket::custom(config)
        .manage::<SharedGrounder>(Arc::new(Mutex::new(grounder)))
        .mount("/", routes![index, predict, api_predict, health])
}

/// Waits for the model asynchronously, then runs one prediction on the blocking pool.
async fn run_prediction(
    grounder: &State<SharedGrounder>,
    image: DynamicImage,
    query: String,
) -> Result<String, ApiError> {
    let mut guard = grounder.inner().clone().lock_owned().await;
    let result = tokio::task::spawn_blocking(move || guard.predict(image, &query))
        .await
        .map_err(|e| (Status::InternalServerError, e.to_string()))?;
    match result {
        Ok(prediction) => Ok(prediction.into_text()),
        Err(e) => {
            error!("prediction failed: {:#}", e);
            Err((Status::InternalServerError, e.to_string()))
        }
    }
}

fn bad_image(e: anyhow::Error) -> ApiError {
    warn!("rejected image: {}", e);
    (Status::BadRequest, e.to_string())
}

#[get("/")]
pub(crate) fn index() -> RawHtml<&'static str> {
    RawHtml(INDEX_HTML)
}

#[derive(FromForm)]
pub(crate) struct PredictForm<'r> {
    image: TempFile<'r>,
    query: String,
}

#[post("/predict", data = "<form>")]
pub(crate) async fn predict(
    form: Form<PredictForm<'_>>,
    grounder: &State<SharedGrounder>,
) -> Result<(ContentType, String), ApiError> {
    let form = form.into_inner();
    let mut reader = Box::pin(
        form.image
            .open()
            .await
            .map_err(|e| (Status::BadRequest, e.to_string()))?,
    );
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| (Status::BadRequest, e.to_string()))?;
    let image = load_image_from_bytes(&bytes).map_err(bad_image)?;
    let text = run_prediction(grounder, image, form.query).await?;
    Ok((ContentType::Plain, text))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PredictRequest {
    /// `data:image/...;base64,` url.
    image: String,
    #[serde(default)]
    query: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct PredictResponse {
    data: String,
}

#[post("/api/predict", data = "<req>")]
pub(crate) async fn api_predict(
    req: Json<PredictRequest>,
    grounder: &State<SharedGrounder>,
) -> Result<Json<PredictResponse>, ApiError> {
    let PredictRequest { image, query } = req.into_inner();
    let image = get_image_from_data_url(&image).map_err(bad_image)?;
    let data = run_prediction(grounder, image, query).await?;
    Ok(Json(PredictResponse { data }))
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: String,
}

#[get("/health")]
pub(crate) fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::{Result, anyhow};
    use base64::{Engine, engine::general_purpose};
    use image::{ImageFormat, RgbImage};
    use rocket::local::blocking::Client;

    use super::*;
    use crate::grounding::testing::ScriptedModel;

    const BOUNDARY: &str = "showui-test-boundary";

    fn client(model: ScriptedModel) -> Result<Client> {
        let grounder = Grounder::new(Box::new(model));
        Ok(Client::tracked(build_rocket(grounder, Config::debug_default()))?)
    }

    fn png() -> Result<Vec<u8>> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(16, 9));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    fn multipart(image: &[u8], query: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"shot.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(image);
        body.extend_from_slice(
            format!(
                "\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"query\"\r\n\r\n{query}\r\n--{BOUNDARY}--\r\n"
            )
            .as_bytes(),
        );
        body
    }

    fn form_type() -> ContentType {
        ContentType::new("multipart", "form-data").with_params(("boundary", BOUNDARY))
    }

    #[test]
    fn index_page_has_the_demo_form() -> Result<()> {
        let client = client(ScriptedModel::new("[0.1, 0.2]"))?;
        let response = client.get("/").dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), Some(ContentType::HTML));
        let body = response.into_string().ok_or(anyhow!("empty body"))?;
        assert!(body.contains("ShowUI-2B"));
        assert!(body.contains("Coordinates"));
        Ok(())
    }

    #[test]
    fn multipart_predict_returns_coordinates() -> Result<()> {
        let client = client(ScriptedModel::new("[0.42, 0.81]"))?;
        let response = client
            .post("/predict")
            .header(form_type())
            .body(multipart(&png()?, "the login button"))
            .dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), Some(ContentType::Plain));
        assert_eq!(response.into_string().as_deref(), Some("0.42, 0.81"));
        Ok(())
    }

    #[test]
    fn undecodable_image_is_a_bad_request() -> Result<()> {
        let client = client(ScriptedModel::new("[0.42, 0.81]"))?;
        let response = client
            .post("/predict")
            .header(form_type())
            .body(multipart(b"definitely not a png", "x"))
            .dispatch();
        assert_eq!(response.status(), Status::BadRequest);
        Ok(())
    }

    #[test]
    fn json_predict_falls_back_to_raw_text() -> Result<()> {
        let client = client(ScriptedModel::new("[0.1, 0.2, 0.3]"))?;
        let image = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(png()?)
        );
        let response = client
            .post("/api/predict")
            .json(&serde_json::json!({"image": image, "query": "menu"}))
            .dispatch();
        assert_eq!(response.status(), Status::Ok);
        let body: serde_json::Value = response
            .into_json()
            .ok_or(anyhow!("response is not json"))?;
        assert_eq!(body, serde_json::json!({"data": "[0.1, 0.2, 0.3]"}));
        Ok(())
    }

    #[test]
    fn json_predict_only_accepts_inline_images() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("showui-api-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("local.png");
        std::fs::write(&path, png()?)?;
        let client = client(ScriptedModel::new("[0.42, 0.81]"))?;
        for image in [
            format!("file://{}", path.display()),
            "http://127.0.0.1:1/shot.png".to_string(),
            path.display().to_string(),
        ] {
            let response = client
                .post("/api/predict")
                .json(&serde_json::json!({"image": image, "query": "x"}))
                .dispatch();
            assert_eq!(response.status(), Status::BadRequest, "{image}");
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn queued_requests_all_complete() -> Result<()> {
        let client = client(ScriptedModel::new("[0.42, 0.81]"))?;
        let body = multipart(&png()?, "x");
        for _ in 0..4 {
            let response = client
                .post("/predict")
                .header(form_type())
                .body(body.clone())
                .dispatch();
            assert_eq!(response.into_string().as_deref(), Some("0.42, 0.81"));
        }
        Ok(())
    }

    #[test]
    fn model_error_is_a_server_error() -> Result<()> {
        let mut model = ScriptedModel::new("[0, 0]");
        model.fail = true;
        let client = client(model)?;
        let response = client
            .post("/predict")
            .header(form_type())
            .body(multipart(&png()?, "x"))
            .dispatch();
        assert_eq!(response.status(), Status::InternalServerError);
        Ok(())
    }

    #[test]
    fn health_reports_ok() -> Result<()> {
        let client = client(ScriptedModel::new(""))?;
        let response = client.get("/health").dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().as_deref(), Some(r#"{"status":"ok"}"#));
        Ok(())
    }

    #[test]
    fn config_rejects_bad_address() {
        assert!(server_config("not-an-ip", 7860).is_err());
        assert!(server_config("0.0.0.0", 7860).is_ok());
    }
}
