use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use lazy_static::lazy_static;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

/// Product metadata endpoint of the vendor cloud.
pub const CATALOG_URL: &str = "http://api-us.doiting.com/api/device_product/model";
pub const DEFAULT_LANGUAGE: &str = "en";
const CATALOG_TIMEOUT: Duration = Duration::from_secs(3);

lazy_static! {
    static ref GLOBAL_CATALOG: Arc<Catalog> = Arc::new(Catalog::new(CATALOG_URL, DEFAULT_LANGUAGE));
}

/// One model entry of a product descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceModel {
    pub device_product_id: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub device_model_name: String,
    /// Registers the model supports.
    #[serde(default)]
    pub dpid: Vec<u32>,
}

/// A device type (`"00"` switch, `"01"` light, ...) with the models belonging to it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProductDescriptor {
    pub device_type_code: String,
    #[serde(default)]
    pub device_model: Vec<DeviceModel>,
}

/// Display metadata resolved for one product id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductMetadata {
    pub device_type_code: Option<String>,
    pub icon: Option<String>,
    pub device_model_name: Option<String>,
    pub dpid: Vec<u32>,
}

#[derive(Deserialize)]
struct CatalogResponse {
    ret: Option<Value>,
    info: Option<CatalogInfo>,
}

#[derive(Deserialize)]
struct CatalogInfo {
    list: Option<Vec<ProductDescriptor>>,
}

/// Cache of the product catalog, fetched at most once.
///
/// Concurrent first lookups share one in-flight request. A failed or empty fetch is not
/// cached; the next lookup tries again. Lookups never fail: any problem reaching or
/// reading the catalog yields an empty product list and devices carry on without
/// display metadata.
#[derive(Debug)]
pub struct Catalog {
    endpoint: String,
    language: String,
    client: Client,
    products: OnceCell<Vec<ProductDescriptor>>,
}

impl Catalog {
    pub fn new(endpoint: &str, language: &str) -> Self {
        let client = Client::builder()
            .timeout(CATALOG_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Catalog {
            endpoint: endpoint.to_string(),
            language: language.to_string(),
            client,
            products: OnceCell::new(),
        }
    }

    /// A catalog that never touches the network.
    pub fn preloaded(products: Vec<ProductDescriptor>) -> Self {
        Catalog {
            endpoint: String::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            client: Client::new(),
            products: OnceCell::new_with(Some(products)),
        }
    }

    /// The process-wide catalog backed by the vendor endpoint.
    pub fn global() -> Arc<Catalog> {
        GLOBAL_CATALOG.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.products.initialized()
    }

    /// All product descriptors, fetching them on first use.
    pub async fn products(&self) -> Vec<ProductDescriptor> {
        match self.products.get_or_try_init(|| self.fetch()).await {
            Ok(products) => products.clone(),
            Err(e) => {
                warn!("Product catalog unavailable: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Resolves the metadata of a product id, `None` if the catalog does not know it.
    pub async fn lookup(&self, product_id: &str) -> Option<ProductMetadata> {
        let products = self.products().await;
        find_product(&products, product_id)
    }

    async fn fetch(&self) -> anyhow::Result<Vec<ProductDescriptor>> {
        debug!("Fetching product catalog from {}", self.endpoint);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("lang", self.language.as_str())])
            .send()
            .await
            .context("Error making catalog request")?
            .error_for_status()
            .context("Catalog request failed")?;
        let body = response.text().await.context("Failed to read catalog body")?;
        parse_catalog(&body)
    }
}

/// Parses a catalog response body. Anything but `ret == "1"` with a product list is an error.
pub fn parse_catalog(body: &str) -> anyhow::Result<Vec<ProductDescriptor>> {
    let response: CatalogResponse =
        serde_json::from_str(body).context("Error decoding catalog response")?;
    match response.ret {
        Some(Value::String(ref ret)) if ret == "1" => {}
        other => bail!("Catalog result is not as expected: ret={:?}", other),
    }
    let list = response
        .info
        .and_then(|info| info.list)
        .ok_or_else(|| anyhow!("Catalog structure is not as expected"))?;
    if list.is_empty() {
        bail!("Catalog is empty");
    }
    Ok(list)
}

fn find_product(products: &[ProductDescriptor], product_id: &str) -> Option<ProductMetadata> {
    products.iter().find_map(|product| {
        product
            .device_model
            .iter()
            .find(|model| model.device_product_id == product_id)
            .map(|model| ProductMetadata {
                device_type_code: Some(product.device_type_code.clone()),
                icon: Some(model.icon.clone()),
                device_model_name: Some(model.device_model_name.clone()),
                dpid: model.dpid.clone(),
            })
    })
}
