fn main() {
    cifar_resnet_core::run();
}
