use controller::api::v1::integration::Integration;
use controller::api::v1::integrationtarget::IntegrationTarget;
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&Integration::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&IntegrationTarget::crd()).unwrap());
}
